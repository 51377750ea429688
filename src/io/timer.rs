//! Cancellable single-shot timers.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// A single-shot delayed callback.
///
/// `schedule` arms the timer (re-arming first cancels the previous
/// schedule), `cancel` disarms it. A cancelled timer never invokes its
/// callback — there is no "fired with a cancelled flag" path. Dropping the
/// timer cancels it.
///
/// Everything runs on the reactor thread, so cancellation cannot race the
/// callback: by the time user code is able to call `cancel`, the callback
/// either already ran (the timer is disarmed) or has not started (the
/// abort prevents it entirely).
pub struct Timer {
    armed: Rc<RefCell<Option<AbortHandle>>>,
}

impl Timer {
    pub fn new() -> Self {
        Timer { armed: Rc::new(RefCell::new(None)) }
    }

    /// Arms the timer to run `cb` after `delay`. A zero delay still
    /// defers the callback to a later reactor turn, never invoking it
    /// from inside `schedule`.
    pub fn schedule(&self, delay: Duration, cb: impl FnOnce() + 'static) {
        self.cancel();
        let armed = Rc::clone(&self.armed);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            // Disarm before running so a cancel() from inside the
            // callback is a no-op rather than an abort of a live task.
            armed.borrow_mut().take();
            cb();
        });
        *self.armed.borrow_mut() = Some(handle.abort_handle());
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.armed.borrow_mut().take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.borrow().is_some()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::block_on;
    use std::cell::Cell;

    #[test]
    fn fires_once() {
        block_on(async {
            let fired = Rc::new(Cell::new(0u32));
            let timer = Timer::new();
            let f = Rc::clone(&fired);
            timer.schedule(Duration::from_millis(10), move || f.set(f.get() + 1));
            assert!(timer.is_armed());
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(fired.get(), 1);
            assert!(!timer.is_armed());
        });
    }

    #[test]
    fn cancel_suppresses_callback() {
        block_on(async {
            let fired = Rc::new(Cell::new(false));
            let timer = Timer::new();
            let f = Rc::clone(&fired);
            timer.schedule(Duration::from_millis(10), move || f.set(true));
            timer.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!fired.get());
        });
    }

    #[test]
    fn rearm_replaces_previous_schedule() {
        block_on(async {
            let which = Rc::new(Cell::new(0u32));
            let timer = Timer::new();
            let w = Rc::clone(&which);
            timer.schedule(Duration::from_millis(10), move || w.set(1));
            let w = Rc::clone(&which);
            timer.schedule(Duration::from_millis(20), move || w.set(2));
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert_eq!(which.get(), 2);
        });
    }

    #[test]
    fn drop_cancels() {
        block_on(async {
            let fired = Rc::new(Cell::new(false));
            {
                let timer = Timer::new();
                let f = Rc::clone(&fired);
                timer.schedule(Duration::from_millis(10), move || f.set(true));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!fired.get());
        });
    }

    #[test]
    fn zero_delay_is_still_asynchronous() {
        block_on(async {
            let fired = Rc::new(Cell::new(false));
            let timer = Timer::new();
            let f = Rc::clone(&fired);
            timer.schedule(Duration::ZERO, move || f.set(true));
            // Not yet: schedule never runs the callback inline.
            assert!(!fired.get());
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(fired.get());
        });
    }
}
