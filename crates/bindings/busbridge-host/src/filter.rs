use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use busbridge_protocol::HandlerResult;

use crate::{Connection, FilterError, Message};

type FilterFn = dyn Fn(&Connection, &Message) -> Result<HandlerResult, FilterError>;

/// A host callable registered on a connection.
///
/// Clones share one allocation, and two filters are the same filter exactly
/// when they share it. Registering the same filter twice makes it run twice.
#[derive(Clone)]
pub struct Filter(Rc<FilterFn>);

impl Filter {
    pub fn new<F>(callable: F) -> Self
    where
        F: Fn(&Connection, &Message) -> Result<HandlerResult, FilterError> + 'static,
    {
        Self(Rc::new(callable))
    }

    pub fn call(&self, connection: &Connection, message: &Message) -> Result<HandlerResult, FilterError> {
        (self.0)(connection, message)
    }

    pub fn ptr_eq(&self, other: &Filter) -> bool {
        // Compare data pointers only; vtable pointers for one closure type
        // are not guaranteed to be unique.
        std::ptr::eq(Rc::as_ptr(&self.0) as *const u8, Rc::as_ptr(&other.0) as *const u8)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter({:p})", Rc::as_ptr(&self.0) as *const u8)
    }
}

/// Ordered filters of one connection wrapper.
#[derive(Default)]
pub(crate) struct FilterList {
    filters: RefCell<Vec<Filter>>,
}

impl FilterList {
    pub(crate) fn push(&self, filter: Filter) {
        self.filters.borrow_mut().push(filter);
    }

    /// Removes the most recently added occurrence of `filter`.
    pub(crate) fn remove_last(&self, filter: &Filter) -> Option<Filter> {
        let mut filters = self.filters.borrow_mut();
        let position = filters.iter().rposition(|registered| registered.ptr_eq(filter))?;
        Some(filters.remove(position))
    }

    pub(crate) fn len(&self) -> usize {
        self.filters.borrow().len()
    }

    /// The list as of now. Dispatch iterates a snapshot so filters can add
    /// or remove filters without disturbing the cycle in progress.
    pub(crate) fn snapshot(&self) -> Vec<Filter> {
        self.filters.borrow().clone()
    }

    /// Empties the list and hands back the filters so the caller can drop
    /// them once the borrow has ended.
    pub(crate) fn take(&self) -> Vec<Filter> {
        std::mem::take(&mut *self.filters.borrow_mut())
    }
}

/// Runs `filters` in order until one claims the message.
///
/// `Handled` and `NeedMemory` end the chain and are returned; an error ends
/// it too. A chain that runs out returns `NotYetHandled`. A filter that
/// finalizes `connection` ends the chain as `Handled`.
pub fn dispatch_chain(
    filters: &[Filter],
    connection: &Connection,
    message: &Message,
) -> Result<HandlerResult, FilterError> {
    for filter in filters {
        if connection.is_finalized() {
            log::debug!("bridge: {} {} finalized mid-dispatch", connection.kind(), connection.handle());
            return Ok(HandlerResult::Handled);
        }
        let verdict = filter.call(connection, message)?;
        if verdict.is_terminal() {
            return Ok(verdict);
        }
    }
    Ok(HandlerResult::NotYetHandled)
}
