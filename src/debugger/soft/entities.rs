//! Entity wrappers adapting wire descriptors to the debugger entity traits.

use crate::debugger::soft::client::{
    ExceptionDescriptor, FrameDescriptor, FrameSlots, ProcessDescriptor, ValueDescriptor,
};
use crate::debugger::soft::SoftShared;
use crate::debugger::{
    DebugException, DebugProcess, DebugStackFrame, DebugThread, DebugVariable, Error, EvalOutcome,
};
use crate::weak_error;
use std::sync::{Arc, Mutex};

pub(super) struct SoftProcess {
    pub shared: Arc<SoftShared>,
    pub desc: ProcessDescriptor,
}

impl DebugProcess for SoftProcess {
    fn id(&self) -> i64 {
        self.desc.id
    }

    fn name(&self) -> String {
        self.desc.name.clone()
    }

    fn threads(&self) -> Result<Vec<Box<dyn DebugThread>>, Error> {
        let descriptors = self.shared.with_client(|c| c.threads(self.desc.id))?;
        Ok(descriptors
            .into_iter()
            .map(|desc| {
                Box::new(SoftThread {
                    shared: self.shared.clone(),
                    id: desc.id,
                    name: desc.name,
                }) as Box<dyn DebugThread>
            })
            .collect())
    }
}

pub(super) struct SoftThread {
    pub shared: Arc<SoftShared>,
    pub id: i64,
    pub name: String,
}

impl DebugThread for SoftThread {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> String {
        if self.name.is_empty() {
            format!("Thread #{}", self.id)
        } else {
            self.name.clone()
        }
    }

    fn stack_frames(&self) -> Result<Vec<Box<dyn DebugStackFrame>>, Error> {
        let frames = self.shared.with_client(|c| c.backtrace(self.id))?;
        Ok(frames
            .into_iter()
            .map(|desc| {
                Box::new(SoftFrame {
                    shared: self.shared.clone(),
                    thread_id: self.id,
                    desc,
                    slots: Mutex::new(None),
                }) as Box<dyn DebugStackFrame>
            })
            .collect())
    }

    fn set_active(&self) -> Result<(), Error> {
        self.shared.with_client(|c| c.set_active_thread(self.id))?;
        self.shared.set_active_thread(self.id);
        Ok(())
    }
}

pub(super) struct SoftFrame {
    pub shared: Arc<SoftShared>,
    pub thread_id: i64,
    pub desc: FrameDescriptor,
    /// Slot values for one frame are fetched from the wire once and reused
    /// by the this/parameters/locals/exception accessors.
    pub slots: Mutex<Option<FrameSlots>>,
}

impl SoftFrame {
    fn fetch_slots(&self) -> Result<FrameSlots, Error> {
        let mut cache = self.slots.lock().expect("should not be poisoned");
        if let Some(slots) = cache.as_ref() {
            return Ok(slots.clone());
        }
        let slots = self
            .shared
            .with_client(|c| c.frame_slots(self.thread_id, self.desc.index))?;
        *cache = Some(slots.clone());
        Ok(slots)
    }

    fn wrap(&self, desc: ValueDescriptor) -> Box<dyn DebugVariable> {
        Box::new(SoftVariable {
            shared: self.shared.clone(),
            desc,
        })
    }
}

impl DebugStackFrame for SoftFrame {
    fn index(&self) -> usize {
        self.desc.index
    }

    fn method_name(&self) -> String {
        if self.desc.method.is_empty() {
            "<unknown>".to_string()
        } else {
            self.desc.method.clone()
        }
    }

    fn file_name(&self) -> Option<String> {
        self.desc.file.clone()
    }

    fn line(&self) -> i64 {
        self.desc.line
    }

    fn column(&self) -> i64 {
        self.desc.column
    }

    fn this_reference(&self) -> Option<Box<dyn DebugVariable>> {
        let slots = weak_error!(self.fetch_slots())?;
        slots.this.map(|desc| self.wrap(desc))
    }

    fn parameters(&self) -> Vec<Box<dyn DebugVariable>> {
        let Some(slots) = weak_error!(self.fetch_slots()) else {
            return vec![];
        };
        slots.parameters.into_iter().map(|d| self.wrap(d)).collect()
    }

    fn local_variables(&self) -> Vec<Box<dyn DebugVariable>> {
        let Some(slots) = weak_error!(self.fetch_slots()) else {
            return vec![];
        };
        slots.locals.into_iter().map(|d| self.wrap(d)).collect()
    }

    fn exception(&self) -> Option<Box<dyn DebugException>> {
        let slots = weak_error!(self.fetch_slots())?;
        slots.exception.map(|desc| {
            Box::new(SoftException {
                shared: self.shared.clone(),
                desc,
            }) as Box<dyn DebugException>
        })
    }

    fn validate_expression(&self, expression: &str) -> bool {
        self.shared
            .with_client(|c| c.validate_expression(self.thread_id, self.desc.index, expression))
            .unwrap_or(false)
    }

    fn evaluate(&self, expression: &str) -> Result<EvalOutcome, Error> {
        let desc = self
            .shared
            .with_client(|c| c.evaluate(self.thread_id, self.desc.index, expression))?;
        Ok(EvalOutcome {
            flags: desc.flags,
            variable: self.wrap(desc),
        })
    }
}

pub(super) struct SoftVariable {
    pub shared: Arc<SoftShared>,
    pub desc: ValueDescriptor,
}

impl DebugVariable for SoftVariable {
    fn name(&self) -> String {
        if self.desc.name.is_empty() {
            "<unnamed>".to_string()
        } else {
            self.desc.name.clone()
        }
    }

    fn display_value(&self) -> String {
        self.desc.display.clone()
    }

    fn type_name(&self) -> Option<String> {
        self.desc.type_name.clone()
    }

    fn has_children(&self) -> bool {
        self.desc.value_ref != 0
    }

    fn children(&self) -> Result<Vec<Box<dyn DebugVariable>>, Error> {
        if self.desc.value_ref == 0 {
            return Ok(vec![]);
        }
        let children = self
            .shared
            .with_client(|c| c.children(self.desc.value_ref))?;
        Ok(children
            .into_iter()
            .map(|desc| {
                Box::new(SoftVariable {
                    shared: self.shared.clone(),
                    desc,
                }) as Box<dyn DebugVariable>
            })
            .collect())
    }
}

pub(super) struct SoftException {
    pub shared: Arc<SoftShared>,
    pub desc: ExceptionDescriptor,
}

impl DebugException for SoftException {
    fn message(&self) -> String {
        self.desc.message.clone()
    }

    fn type_name(&self) -> String {
        self.desc.type_name.clone()
    }

    fn instance(&self) -> Option<Box<dyn DebugVariable>> {
        self.desc.instance.clone().map(|desc| {
            Box::new(SoftVariable {
                shared: self.shared.clone(),
                desc,
            }) as Box<dyn DebugVariable>
        })
    }
}
