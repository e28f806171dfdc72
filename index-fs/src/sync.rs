//! Semaphore

use std::sync::{Condvar, Mutex};

/// A counting semaphore.
///
/// `down` blocks the calling thread while the count is not positive;
/// `up` increments the count and wakes one waiter.
pub struct Semaphore {
    count: Mutex<isize>,
    wait_queue: Condvar,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(res_count: usize) -> Self {
        Self {
            count: Mutex::new(res_count as isize),
            wait_queue: Condvar::new(),
        }
    }

    /// up operation of semaphore
    pub fn up(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        self.wait_queue.notify_one();
    }

    /// down operation of semaphore
    pub fn down(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count <= 0 {
            count = self
                .wait_queue
                .wait(count)
                .unwrap_or_else(|e| e.into_inner());
        }
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn down_waits_for_up() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.down();
                sem.down();
            })
        };
        sem.up();
        sem.up();
        waiter.join().unwrap();
    }
}
