//! The stack of debug event handlers.
//!
//! The top handler sees every event first. Temporary policies push themselves, pass events
//! they don't care about to their predecessor with [`Debugger::dispatch_event`], and are
//! dropped as soon as they report [`DebugEventHandler::is_finished`].

use log::warn;

use crate::debugger::Debugger;
use crate::event::{DebugEvent, EventStatus};
use crate::target::Platform;

pub trait DebugEventHandler<P: Platform> {
    /// Decides what happens after `event`. While this runs the handler is detached from the
    /// stack, so `dbg.dispatch_event(event)` reaches the previous handler.
    fn handle_event(&mut self, dbg: &mut Debugger<P>, event: &DebugEvent) -> EventStatus;

    /// Finished handlers are removed from the stack right after `handle_event` returns.
    fn is_finished(&self) -> bool {
        false
    }
}

pub struct HandlerStack<P: Platform> {
    handlers: Vec<Box<dyn DebugEventHandler<P>>>,
}

impl<P: Platform> HandlerStack<P> {
    pub fn new() -> Self {
        HandlerStack {
            handlers: Vec::new(),
        }
    }

    pub fn push(&mut self, handler: Box<dyn DebugEventHandler<P>>) {
        self.handlers.push(handler);
    }

    pub fn pop(&mut self) -> Option<Box<dyn DebugEventHandler<P>>> {
        self.handlers.pop()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<P: Platform> Default for HandlerStack<P> {
    fn default() -> Self {
        HandlerStack::new()
    }
}

impl<P: Platform> Debugger<P> {
    pub fn push_handler(&mut self, handler: Box<dyn DebugEventHandler<P>>) {
        self.handlers.push(handler);
    }

    /// Hands `event` to the top handler and returns its decision.
    pub fn dispatch_event(&mut self, event: &DebugEvent) -> EventStatus {
        let mut handler = match self.handlers.pop() {
            Some(handler) => handler,
            None => {
                warn!("no handler for {:?}", event.status());
                return EventStatus::Stop;
            }
        };

        let status = handler.handle_event(self, event);
        if !handler.is_finished() {
            self.handlers.push(handler);
        }
        status
    }

    pub fn handler_depth(&self) -> usize {
        self.handlers.len()
    }
}
