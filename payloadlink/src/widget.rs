//! Widget values shared between the payload and the operator's app.
//!
//! Writes come from two sides: the payload application ([`WidgetStore::set`])
//! and the operator ([`WidgetStore::apply_remote`]). The last write wins.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt;

/// Kind of UI widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WidgetType {
    /// Momentary button: 0 released, 1 pressed.
    Button,
    /// Two-state switch: 0 off, 1 on.
    Switch,
    /// Slider: 0..=100.
    Scale,
    /// Drop-down list: selected item index.
    List,
    /// Free integer input.
    IntInputBox,
}

impl WidgetType {
    /// Check a value against the widget's range.
    pub fn validate(self, value: i32) -> Result<()> {
        let ok = match self {
            Self::Button | Self::Switch => matches!(value, 0 | 1),
            Self::Scale => (0..=100).contains(&value),
            Self::List => value >= 0,
            Self::IntInputBox => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidParameter(format!(
                "value {value} out of range for {self}"
            )))
        }
    }
}

impl fmt::Display for WidgetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Button => "button",
            Self::Switch => "switch",
            Self::Scale => "scale",
            Self::List => "list",
            Self::IntInputBox => "int input box",
        };
        write!(f, "{name}")
    }
}

/// Value of one widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WidgetState {
    /// Widget kind.
    pub widget_type: WidgetType,
    /// Index within its kind.
    pub index: u32,
    /// Current value.
    pub value: i32,
}

impl WidgetState {
    /// New widget value.
    pub fn new(widget_type: WidgetType, index: u32, value: i32) -> Self {
        Self {
            widget_type,
            index,
            value,
        }
    }
}

/// Latest widget values plus change subscribers.
#[derive(Default)]
pub struct WidgetStore {
    values: HashMap<(WidgetType, u32), i32>,
    subscribers: Vec<Sender<WidgetState>>,
}

impl WidgetStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Local write from the payload application.
    pub fn set(&mut self, state: WidgetState) -> Result<()> {
        self.write(state, "local")
    }

    /// Write received from the operator.
    pub fn apply_remote(&mut self, state: WidgetState) -> Result<()> {
        self.write(state, "remote")
    }

    /// Current value, if the widget was ever written.
    pub fn get(&self, widget_type: WidgetType, index: u32) -> Option<i32> {
        self.values
            .get(&(widget_type, index))
            .copied()
    }

    /// All known values, ordered by type then index.
    pub fn snapshot(&self) -> Vec<WidgetState> {
        let mut states: Vec<_> = self
            .values
            .iter()
            .map(|(&(widget_type, index), &value)| WidgetState::new(widget_type, index, value))
            .collect();
        states.sort_by_key(|s| (s.widget_type as u8, s.index));
        states
    }

    /// Receive every accepted write. A subscriber whose queue is full misses
    /// updates.
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<WidgetState> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        self.subscribers.push(sender);
        receiver
    }

    fn write(&mut self, state: WidgetState, origin: &str) -> Result<()> {
        state.widget_type.validate(state.value)?;
        let previous = self
            .values
            .insert((state.widget_type, state.index), state.value);
        debug!(
            "{origin} write: {} #{} = {} (was {:?})",
            state.widget_type, state.index, state.value, previous
        );

        self.subscribers.retain(|sub| match sub.try_send(state) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Widget subscriber lagging, dropped update for {} #{}",
                    state.widget_type, state.index
                );
                true
            },
            Err(TrySendError::Disconnected(_)) => {
                trace!("Removing disconnected widget subscriber");
                false
            },
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(WidgetType::Switch.validate(1).is_ok());
        assert!(WidgetType::Switch.validate(2).is_err());
        assert!(WidgetType::Scale.validate(100).is_ok());
        assert!(WidgetType::Scale.validate(101).is_err());
        assert!(WidgetType::List.validate(-1).is_err());
        assert!(WidgetType::IntInputBox.validate(i32::MIN).is_ok());
    }

    #[test]
    fn test_last_write_wins() {
        let mut store = WidgetStore::new();
        store
            .set(WidgetState::new(WidgetType::Scale, 0, 30))
            .unwrap();
        store
            .apply_remote(WidgetState::new(WidgetType::Scale, 0, 70))
            .unwrap();
        assert_eq!(store.get(WidgetType::Scale, 0), Some(70));
        assert_eq!(store.get(WidgetType::Scale, 1), None);

        assert!(store
            .apply_remote(WidgetState::new(WidgetType::Scale, 0, 700))
            .is_err());
        assert_eq!(store.get(WidgetType::Scale, 0), Some(70));
    }

    #[test]
    fn test_subscribers() {
        let mut store = WidgetStore::new();
        let fast = store.subscribe(8);
        let slow = store.subscribe(1);
        let gone = store.subscribe(1);
        drop(gone);

        for value in [0, 1, 0] {
            store
                .set(WidgetState::new(WidgetType::Switch, 2, value))
                .unwrap();
        }

        let seen: Vec<i32> = fast.try_iter().map(|s| s.value).collect();
        assert_eq!(seen, vec![0, 1, 0]);
        assert_eq!(slow.try_iter().count(), 1);
        assert_eq!(store.subscribers.len(), 2);
    }

    #[test]
    fn test_snapshot_order() {
        let mut store = WidgetStore::new();
        store.set(WidgetState::new(WidgetType::List, 1, 3)).unwrap();
        store.set(WidgetState::new(WidgetType::Button, 4, 1)).unwrap();
        store.set(WidgetState::new(WidgetType::Button, 0, 0)).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap[0], WidgetState::new(WidgetType::Button, 0, 0));
        assert_eq!(snap[2].widget_type, WidgetType::List);
    }
}
