// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative single-threaded executor and wait primitives.
//!
//! Tasks are futures polled from the event loop; there is no preemption
//! between tasks, and every suspension point is an await on a future handed
//! out by a driver or one of the primitives in this crate. Interrupt glue may
//! wake tasks (wakers only touch the ready queue, which sits behind a
//! critical section); everything else is event-loop-only.
//!
//! The usual shape of a driver wait list here is index- or key-based rather
//! than pointer-linked: a future registers itself under a key and removes
//! that registration in `Drop`, which is what makes dropping a future (e.g.
//! the losing arm of [`select2`]) equivalent to cancelling the operation.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

mod barrier;
mod event;
mod select;
mod wakerset;

pub use barrier::{Barrier, BarrierWait};
pub use event::{Event, EventWait};
pub use select::{select2, select3, Select2, Select3};
pub use wakerset::WakerSet;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::sync::Arc;
use alloc::task::Wake;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Waker};
use critical_section::Mutex;

/// Handle to a spawned task. Generation-checked, so a stale id for a reused
/// slot is a no-op rather than a cancellation of the wrong task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskId {
    slot: u16,
    generation: u16,
}

/// The ready queue is the one structure wakers touch, possibly from
/// interrupt context, so it lives behind a critical section.
struct ReadyQueue {
    queue: Mutex<RefCell<VecDeque<TaskId>>>,
}

impl ReadyQueue {
    fn push(&self, id: TaskId) {
        critical_section::with(|cs| {
            let mut q = self.queue.borrow_ref_mut(cs);
            if !q.contains(&id) {
                q.push_back(id);
            }
        });
    }

    fn pop(&self) -> Option<TaskId> {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).pop_front())
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

enum Slot {
    Vacant {
        generation: u16,
    },
    Occupied {
        generation: u16,
        fut: Pin<Box<dyn Future<Output = ()>>>,
    },
    /// The task is currently being polled; its future is temporarily out of
    /// the table so the table borrow can be released during the poll.
    Running {
        generation: u16,
        cancelled: bool,
    },
}

impl Slot {
    fn generation(&self) -> u16 {
        match self {
            Slot::Vacant { generation }
            | Slot::Occupied { generation, .. }
            | Slot::Running { generation, .. } => *generation,
        }
    }
}

struct Inner {
    tasks: RefCell<Vec<Slot>>,
    ready: Arc<ReadyQueue>,
}

/// The executor. Cheap to clone; clones share the task table, so tasks can
/// capture a clone and spawn or cancel siblings.
#[derive(Clone)]
pub struct Executor {
    inner: Rc<Inner>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                tasks: RefCell::new(Vec::new()),
                ready: Arc::new(ReadyQueue {
                    queue: Mutex::new(RefCell::new(VecDeque::new())),
                }),
            }),
        }
    }

    /// Adds a task and schedules its first poll.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> TaskId {
        let fut: Pin<Box<dyn Future<Output = ()>>> = Box::pin(fut);
        let mut tasks = self.inner.tasks.borrow_mut();
        let slot = tasks
            .iter()
            .position(|s| matches!(s, Slot::Vacant { .. }));
        let id = match slot {
            Some(i) => {
                let generation = tasks[i].generation();
                tasks[i] = Slot::Occupied { generation, fut };
                TaskId {
                    slot: i as u16,
                    generation,
                }
            }
            None => {
                tasks.push(Slot::Occupied { generation: 0, fut });
                TaskId {
                    slot: (tasks.len() - 1) as u16,
                    generation: 0,
                }
            }
        };
        drop(tasks);
        self.inner.ready.push(id);
        id
    }

    /// Cancels a task: its future is dropped, which removes any wait-list
    /// registrations it holds. Stale ids are ignored.
    pub fn cancel(&self, id: TaskId) {
        let mut tasks = self.inner.tasks.borrow_mut();
        let Some(slot) = tasks.get_mut(id.slot as usize) else {
            return;
        };
        if slot.generation() != id.generation {
            return;
        }
        match slot {
            Slot::Occupied { generation, .. } => {
                *slot = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
            }
            Slot::Running { cancelled, .. } => {
                // Mid-poll (a task cancelling itself); defer the drop until
                // the poll returns.
                *cancelled = true;
            }
            Slot::Vacant { .. } => {}
        }
    }

    /// Polls ready tasks until the ready queue is empty.
    pub fn run_until_idle(&self) {
        while let Some(id) = self.inner.ready.pop() {
            let fut = {
                let mut tasks = self.inner.tasks.borrow_mut();
                let Some(slot) = tasks.get_mut(id.slot as usize) else {
                    continue;
                };
                if slot.generation() != id.generation {
                    continue;
                }
                match core::mem::replace(
                    slot,
                    Slot::Running {
                        generation: id.generation,
                        cancelled: false,
                    },
                ) {
                    Slot::Occupied { fut, .. } => fut,
                    other => {
                        *slot = other;
                        continue;
                    }
                }
            };

            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: Arc::clone(&self.inner.ready),
            }));
            let mut fut = fut;
            let done = fut
                .as_mut()
                .poll(&mut Context::from_waker(&waker))
                .is_ready();

            let mut tasks = self.inner.tasks.borrow_mut();
            let slot = &mut tasks[id.slot as usize];
            let cancelled = matches!(
                slot,
                Slot::Running {
                    cancelled: true,
                    ..
                }
            );
            if done || cancelled {
                *slot = Slot::Vacant {
                    generation: id.generation.wrapping_add(1),
                };
            } else {
                *slot = Slot::Occupied {
                    generation: id.generation,
                    fut,
                };
            }
        }
    }

    /// True if a wake arrived since the last `run_until_idle`.
    pub fn has_ready(&self) -> bool {
        critical_section::with(|cs| {
            !self.inner.ready.queue.borrow_ref(cs).is_empty()
        })
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.inner
            .tasks
            .borrow()
            .iter()
            .filter(|s| !matches!(s, Slot::Vacant { .. }))
            .count()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}
