//! Cluster metadata cache.
//!
//! Rebuilt wholesale from each metadata response; never patched in place.

use std::collections::HashMap;

use kafka_mux_wire::{KafkaCode, MetadataResponse};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub(crate) struct BrokerAddr {
    pub host: String,
    pub port: i32,
}

impl BrokerAddr {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PartitionInfo {
    /// -1 while a leader election is in progress.
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MetadataCache {
    brokers: HashMap<i32, BrokerAddr>,
    topics: HashMap<String, HashMap<i32, PartitionInfo>>,
}

impl MetadataCache {
    pub fn from_response(response: &MetadataResponse) -> Self {
        let brokers = response
            .brokers
            .iter()
            .map(|b| {
                (
                    b.node_id,
                    BrokerAddr {
                        host: b.host.clone(),
                        port: b.port,
                    },
                )
            })
            .collect();
        let topics = response
            .topics
            .iter()
            .filter(|t| t.error == KafkaCode::None)
            .map(|t| {
                let partitions = t
                    .partitions
                    .iter()
                    .map(|p| {
                        (
                            p.partition,
                            PartitionInfo {
                                leader: p.leader,
                                replicas: p.replicas.clone(),
                                isr: p.isr.clone(),
                            },
                        )
                    })
                    .collect();
                (t.name.clone(), partitions)
            })
            .collect();
        Self { brokers, topics }
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    pub fn partition(&self, topic: &str, partition: i32) -> Result<&PartitionInfo> {
        self.topics
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
            .ok_or_else(|| Error::Metadata {
                topic: topic.to_string(),
                partition,
            })
    }

    pub fn broker_addr(&self, broker_id: i32) -> Result<String> {
        self.brokers
            .get(&broker_id)
            .map(BrokerAddr::addr)
            .ok_or_else(|| {
                Error::Protocol(format!("broker {broker_id} missing from metadata"))
            })
    }

    /// Node id of the broker listening on `addr`, if the cluster lists one.
    pub fn node_for_addr(&self, addr: &str) -> Option<i32> {
        self.brokers
            .iter()
            .find(|(_, b)| b.addr() == addr)
            .map(|(id, _)| *id)
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn partition_ids(&self, topic: &str) -> Result<Vec<i32>> {
        let partitions = self
            .topics
            .get(topic)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
        let mut ids: Vec<i32> = partitions.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
