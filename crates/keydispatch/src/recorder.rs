//! Time series of one KeyVar field, for strip charts.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::error::KeyVarError;
use crate::keyvar::{CallbackId, KeyVar};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Bounded ring of samples taken from one position of a KeyVar.
///
/// Only genuine, current updates with a value are recorded: cache replays
/// after a reconnect would otherwise plot old readings at the current time.
pub struct SampleRecorder {
    key_var: KeyVar,
    index: usize,
    id: CallbackId,
    samples: Rc<RefCell<VecDeque<Sample>>>,
}

impl SampleRecorder {
    pub fn attach(key_var: &KeyVar, index: usize, capacity: usize) -> Result<Self, KeyVarError> {
        let samples = Rc::new(RefCell::new(VecDeque::with_capacity(capacity)));
        let ring = samples.clone();
        let id = key_var.add_indexed_callback(
            move |value, is_current, kv| {
                if !is_current || !kv.is_genuine() || capacity == 0 {
                    return;
                }
                let Some(value) = value.and_then(|v| v.as_f64()) else {
                    return;
                };
                let mut ring = ring.borrow_mut();
                if ring.len() == capacity {
                    ring.pop_front();
                }
                ring.push_back(Sample {
                    time: Utc::now(),
                    value,
                });
            },
            index,
            false,
        )?;

        Ok(Self {
            key_var: key_var.clone(),
            index,
            id,
            samples,
        })
    }

    pub fn key_var(&self) -> &KeyVar {
        &self.key_var
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Oldest first.
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.borrow().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.borrow().is_empty()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.borrow().back().copied()
    }

    pub fn clear(&self) {
        self.samples.borrow_mut().clear();
    }

    /// Stop recording; collected samples are returned.
    pub fn detach(self) -> Vec<Sample> {
        self.key_var.remove_callback(self.id);
        self.samples()
    }
}
