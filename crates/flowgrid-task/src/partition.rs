//! In-process result partitions and the channels that read them.
//!
//! A producer attempt writes one `ResultPartition` per produced result.
//! Consumer replicas subscribe per consumer index; within one consumer
//! group records are spread round-robin over the subscribed replicas,
//! while events reach every subscriber. Subscribers may join while the
//! producer is running, which is how spliced operators and new replicas
//! attach to live data.

use std::sync::{Mutex, PoisonError};

use flow_core::PartitionId;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::TaskResult;
use crate::event::{self, ChannelEvent, TaskEvent};

/// What travels through a channel. Events are already encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum WireElement {
    Record(Value),
    Event(Vec<u8>),
}

/// An element tagged with the input channel it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct InputElement {
    pub channel: usize,
    pub element: WireElement,
}

pub type InputSender = mpsc::UnboundedSender<InputElement>;
pub type InputReceiver = mpsc::UnboundedReceiver<InputElement>;

/// The writing end of one input channel of a consumer replica.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    channel: usize,
    tx: InputSender,
}

impl ChannelWriter {
    pub fn new(channel: usize, tx: InputSender) -> Self {
        Self { channel, tx }
    }

    fn send(&self, element: WireElement) -> bool {
        self.tx
            .send(InputElement {
                channel: self.channel,
                element,
            })
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    channels: Vec<ChannelWriter>,
    next: usize,
}

#[derive(Debug, Default)]
struct PartitionState {
    groups: Vec<ConsumerGroup>,
    finished: bool,
}

#[derive(Debug)]
pub struct ResultPartition {
    id: PartitionId,
    state: Mutex<PartitionState>,
}

impl ResultPartition {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            state: Mutex::new(PartitionState::default()),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Attach a consumer channel under `consumer_index`.
    pub fn subscribe(&self, consumer_index: usize, writer: ChannelWriter) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.finished {
            writer.send(WireElement::Event(end_of_partition()));
            return;
        }
        if state.groups.len() <= consumer_index {
            state.groups.resize_with(consumer_index + 1, ConsumerGroup::default);
        }
        state.groups[consumer_index].channels.push(writer);
        debug!(partition = %self.id, consumer_index, "consumer subscribed");
    }

    pub fn num_subscribers(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.groups.iter().map(|g| g.channels.len()).sum()
    }

    /// Send a record to one subscriber of every consumer group.
    pub fn emit(&self, record: &Value) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for group in &mut state.groups {
            while !group.channels.is_empty() {
                let idx = group.next % group.channels.len();
                if group.channels[idx].send(WireElement::Record(record.clone())) {
                    group.next = idx + 1;
                    break;
                }
                trace!(partition = %self.id, "dropping closed consumer channel");
                group.channels.remove(idx);
            }
        }
    }

    /// Send an event to every subscriber.
    pub fn broadcast(&self, event: &ChannelEvent) -> TaskResult<()> {
        let bytes = event::encode(event)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for group in &mut state.groups {
            group
                .channels
                .retain(|c| c.send(WireElement::Event(bytes.clone())));
        }
        Ok(())
    }

    /// Signal end of data and drop every subscriber.
    pub fn finish(&self) {
        let bytes = end_of_partition();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for group in state.groups.drain(..) {
            for channel in group.channels {
                channel.send(WireElement::Event(bytes.clone()));
            }
        }
        state.finished = true;
        debug!(partition = %self.id, "partition finished");
    }
}

fn end_of_partition() -> Vec<u8> {
    // Generic events always encode.
    event::encode_generic(&ChannelEvent::Task(TaskEvent::EndOfPartition)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn channel(n: usize) -> (ChannelWriter, InputReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelWriter::new(n, tx), rx)
    }

    #[test]
    fn records_round_robin_within_a_group() {
        let partition = ResultPartition::new(PartitionId::from_raw(1));
        let (a, mut rx_a) = channel(0);
        let (b, mut rx_b) = channel(0);
        partition.subscribe(0, a);
        partition.subscribe(0, b);

        for i in 0..4 {
            partition.emit(&json!(i));
        }
        let got_a: Vec<_> = std::iter::from_fn(|| rx_a.try_recv().ok()).collect();
        let got_b: Vec<_> = std::iter::from_fn(|| rx_b.try_recv().ok()).collect();
        assert_eq!(got_a.len(), 2);
        assert_eq!(got_b.len(), 2);
        assert_eq!(got_a[0].element, WireElement::Record(json!(0)));
        assert_eq!(got_b[0].element, WireElement::Record(json!(1)));
    }

    #[test]
    fn each_group_sees_every_record() {
        let partition = ResultPartition::new(PartitionId::from_raw(1));
        let (a, mut rx_a) = channel(0);
        let (b, mut rx_b) = channel(3);
        partition.subscribe(0, a);
        partition.subscribe(1, b);

        partition.emit(&json!("x"));
        assert!(rx_a.try_recv().is_ok());
        let got = rx_b.try_recv().unwrap();
        assert_eq!(got.channel, 3);
    }

    #[test]
    fn events_reach_all_subscribers() {
        let partition = ResultPartition::new(PartitionId::from_raw(1));
        let (a, mut rx_a) = channel(0);
        let (b, mut rx_b) = channel(1);
        partition.subscribe(0, a);
        partition.subscribe(0, b);

        partition
            .broadcast(&ChannelEvent::Task(TaskEvent::EndOfSuperstep))
            .unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            let WireElement::Event(bytes) = rx.try_recv().unwrap().element else {
                panic!("expected event");
            };
            assert_eq!(event::decode(&bytes).unwrap(), ChannelEvent::Task(TaskEvent::EndOfSuperstep));
        }
    }

    #[test]
    fn closed_channels_are_dropped() {
        let partition = ResultPartition::new(PartitionId::from_raw(1));
        let (a, rx_a) = channel(0);
        let (b, mut rx_b) = channel(1);
        partition.subscribe(0, a);
        partition.subscribe(0, b);
        drop(rx_a);

        partition.emit(&json!(1));
        partition.emit(&json!(2));
        assert_eq!(partition.num_subscribers(), 1);
        assert_eq!(std::iter::from_fn(|| rx_b.try_recv().ok()).count(), 2);
    }

    #[test]
    fn late_subscriber_of_finished_partition_sees_end() {
        let partition = ResultPartition::new(PartitionId::from_raw(1));
        partition.finish();
        let (a, mut rx_a) = channel(0);
        partition.subscribe(0, a);
        let WireElement::Event(bytes) = rx_a.try_recv().unwrap().element else {
            panic!("expected event");
        };
        assert_eq!(event::decode(&bytes).unwrap(), ChannelEvent::Task(TaskEvent::EndOfPartition));
        assert_eq!(partition.num_subscribers(), 0);
    }
}
