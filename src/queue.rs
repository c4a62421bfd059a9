use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A capacity-bounded FIFO for one consumer and many producers.
///
/// `push` blocks while the queue is full, `pop` blocks while it is
/// empty.
#[derive(Clone, Debug)]
pub struct BoundedQueue<T>
where
    T: Send,
{
    inner: Arc<BoundedQueueInner<T>>,
}

#[derive(Debug)]
struct BoundedQueueInner<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T>
where
    T: Send,
{
    pub fn with_capacity(capacity: usize) -> BoundedQueue<T> {
        BoundedQueue {
            inner: Arc::new(BoundedQueueInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, value: T) {
        let mut queue = self.inner.queue.lock().unwrap();
        while queue.len() >= self.inner.capacity {
            queue = self.inner.not_full.wait(queue).unwrap();
        }
        queue.push_back(value);

        self.inner.not_empty.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut queue = self.inner.queue.lock().unwrap();

        loop {
            if let Some(elem) = queue.pop_front() {
                self.inner.not_full.notify_one();
                return elem;
            }

            queue = self.inner.not_empty.wait(queue).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut queue = self.inner.queue.lock().unwrap();
        let elem = queue.pop_front();
        if elem.is_some() {
            self.inner.not_full.notify_one();
        }
        elem
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
