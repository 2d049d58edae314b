use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{Error, Result},
    protocol::sync_group::request::{MemberAssignment, PartitionAssignment},
};

pub const ROUND_ROBIN_PROTOCOL: &str = "roundrobin";

/// One member of the group as the leader sees it in the join response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMember {
    pub member_id: String,
    pub topics: Vec<String>,
}

/// Compute every member's assignment. Only the group leader does this.
///
/// `partitions` lists the partitions of each subscribed topic.
pub fn assign(
    strategy: &str,
    members: &[GroupMember],
    partitions: &BTreeMap<String, Vec<i32>>,
) -> Result<Vec<(String, MemberAssignment)>> {
    match strategy {
        ROUND_ROBIN_PROTOCOL => Ok(round_robin(members, partitions)),
        _ => Err(Error::Config(format!(
            "assignment strategy {:?} is not supported",
            strategy
        ))),
    }
}

/// The round robin assignor lays out all the available partitions and
/// all the available consumers, both sorted. It then proceeds to do a
/// round robin assignment from partition to consumer, skipping consumers
/// that are not subscribed to the partition's topic. If the subscriptions
/// of all consumer instances are identical, then the partitions will be
/// uniformly distributed. (i.e., the partition ownership counts will be
/// within a delta of exactly one across all consumers.)
fn round_robin(
    members: &[GroupMember],
    partitions: &BTreeMap<String, Vec<i32>>,
) -> Vec<(String, MemberAssignment)> {
    let mut members: Vec<&GroupMember> = members.iter().collect();
    members.sort_by(|a, b| a.member_id.cmp(&b.member_id));
    members.dedup_by(|a, b| a.member_id == b.member_id);

    let mut owned: Vec<BTreeMap<String, BTreeSet<i32>>> = vec![BTreeMap::new(); members.len()];
    let mut next = 0;
    for (topic, topic_partitions) in partitions {
        let subscribers = members
            .iter()
            .filter(|m| m.topics.iter().any(|t| t == topic))
            .count();
        if subscribers == 0 {
            continue;
        }
        let mut sorted = topic_partitions.clone();
        sorted.sort_unstable();
        for partition in sorted {
            // advance to the next member subscribed to this topic
            while !members[next % members.len()].topics.iter().any(|t| t == topic) {
                next += 1;
            }
            owned[next % members.len()]
                .entry(topic.clone())
                .or_default()
                .insert(partition);
            next += 1;
        }
    }

    members
        .iter()
        .zip(owned)
        .map(|(member, topics)| {
            let assignments = topics
                .into_iter()
                .map(|(topic, partitions)| {
                    PartitionAssignment::new(&topic, partitions.into_iter().collect())
                })
                .collect();
            (member.member_id.clone(), MemberAssignment::new(assignments))
        })
        .collect()
}
