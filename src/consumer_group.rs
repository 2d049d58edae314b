//! Membership of a consumer group.
//!
//! A member finds the group coordinator, joins, and receives its share of
//! the partitions through a sync. The leader elected by the coordinator
//! computes every member's share with the [`assignor`](crate::assignor).
//! After that the member heartbeats to stay in the group. A heartbeat
//! the coordinator answers with a rejoin code, or a session that went too
//! long without a successful heartbeat, moves the member to
//! [`MembershipState::Rebalancing`].
//!
//! Every group request carries the generation ID of the join it belongs
//! to, so the coordinator can reject requests from a superseded
//! generation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};
use tracing::instrument;

use crate::{
    assignor::{assign, GroupMember, ROUND_ROBIN_PROTOCOL},
    config::BrokerEndpoint,
    error::{Error, KafkaCode, Result},
    metadata::{ClusterMetadata, TopicPartition},
    network::{Connection, PendingResponse},
    protocol::{
        join_group::request::Protocol, sync_group::request::Assignment, FindCoordinatorRequest,
        HeartbeatRequest, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
        OffsetCommitRequest, OffsetFetchRequest, SyncGroupRequest, SyncGroupResponse,
    },
};

/// Generation ID of a member that has not joined yet.
pub const NO_GENERATION: i32 = -1;

const JOIN_ATTEMPTS: u32 = 10;
const JOIN_BACKOFF: Duration = Duration::from_millis(200);
/// Extra time on top of the rebalance timeout for a join to be answered.
const JOIN_SLACK: Duration = Duration::from_secs(5);

/// A group request whose answer is still due, with the instant it is given up on.
type InFlight<T> = Option<(PendingResponse<T>, Instant)>;

/// Where a member is in the group protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipState {
    Unjoined,
    Joining,
    Syncing,
    /// Holds an assignment and heartbeats.
    Stable,
    /// The assignment is stale and the member has to join again.
    Rebalancing,
    /// Left the group for good.
    Dead,
}

#[derive(Clone, Debug)]
pub(crate) struct GroupSettings {
    pub group_id: String,
    pub session_timeout: Duration,
    pub rebalance_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl GroupSettings {
    fn session_timeout_ms(&self) -> i32 {
        i32::try_from(self.session_timeout.as_millis()).unwrap_or(i32::MAX)
    }

    fn rebalance_timeout_ms(&self) -> i32 {
        i32::try_from(self.rebalance_timeout.as_millis()).unwrap_or(i32::MAX)
    }
}

#[derive(Debug)]
pub struct GroupMembership {
    settings: GroupSettings,
    topics: Vec<String>,
    state: MembershipState,
    coordinator: Option<Connection>,
    member_id: String,
    generation_id: i32,
    assignment: BTreeSet<TopicPartition>,
    last_heartbeat: Instant,
    // outlive a join that was cut short, so the next one picks the answer up
    pending_join: InFlight<JoinGroupResponse>,
    pending_sync: InFlight<SyncGroupResponse>,
}

impl GroupMembership {
    pub(crate) fn new(settings: GroupSettings, topics: Vec<String>) -> Self {
        Self {
            settings,
            topics,
            state: MembershipState::Unjoined,
            coordinator: None,
            member_id: String::new(),
            generation_id: NO_GENERATION,
            assignment: BTreeSet::new(),
            last_heartbeat: Instant::now(),
            pending_join: None,
            pending_sync: None,
        }
    }

    pub fn state(&self) -> MembershipState {
        self.state
    }

    pub fn group_id(&self) -> &str {
        &self.settings.group_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    /// Partitions of the current generation. Stale while rebalancing.
    pub fn assignment(&self) -> &BTreeSet<TopicPartition> {
        &self.assignment
    }

    pub fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.state == MembershipState::Stable && self.assignment.contains(tp)
    }

    /// Note that the assignment can no longer be trusted.
    pub fn mark_rebalance(&mut self) {
        if matches!(
            self.state,
            MembershipState::Joining | MembershipState::Syncing | MembershipState::Stable
        ) {
            tracing::info!(
                "Member {:?} | Group {} needs to rebalance after generation {}",
                self.member_id,
                self.settings.group_id,
                self.generation_id
            );
            self.state = MembershipState::Rebalancing;
        }
    }

    pub fn heartbeat_due(&self) -> bool {
        self.state == MembershipState::Stable
            && self.last_heartbeat.elapsed() >= self.settings.heartbeat_interval
    }

    /// Whether the coordinator has likely evicted this member for missing
    /// heartbeats.
    pub fn session_expired(&self) -> bool {
        self.state == MembershipState::Stable
            && self.last_heartbeat.elapsed() >= self.settings.session_timeout
    }

    /// Join the group and sync, retrying transient failures. On success
    /// the member is [`Stable`](MembershipState::Stable) with a fresh
    /// assignment.
    ///
    /// Cancel safe while waiting on the coordinator: a JoinGroup or
    /// SyncGroup that is already sent stays outstanding, and the next call
    /// waits for its answer instead of sending another.
    #[instrument(level = "debug", skip(self, metadata), fields(group = %self.settings.group_id))]
    pub async fn join(&mut self, metadata: &mut ClusterMetadata) -> Result<()> {
        if self.state == MembershipState::Dead {
            return Err(Error::ClientClosed);
        }
        self.assignment.clear();

        let mut last_error = Error::Timeout;
        for attempt in 0..JOIN_ATTEMPTS {
            // a member id handed out by the coordinator is used right away
            if attempt > 0 && last_error != Error::Broker(KafkaCode::MemberIdRequired) {
                sleep(JOIN_BACKOFF).await;
            }
            match self.join_once(metadata).await {
                Ok(()) => return Ok(()),
                Err(err) if self.retry_join(&err, metadata) => {
                    tracing::warn!(
                        "Member {:?} | Join attempt {} failed: {}",
                        self.member_id,
                        attempt + 1,
                        err
                    );
                    last_error = err;
                }
                Err(err) => {
                    self.state = MembershipState::Unjoined;
                    return Err(err);
                }
            }
        }
        self.state = MembershipState::Unjoined;
        Err(last_error)
    }

    fn retry_join(&mut self, err: &Error, metadata: &mut ClusterMetadata) -> bool {
        match err {
            Error::Broker(KafkaCode::UnknownMemberId) => {
                self.member_id.clear();
                true
            }
            Error::Broker(code) if code.requires_rejoin() => true,
            Error::Broker(code) if code.is_retriable() => {
                if code.invalidates_metadata() {
                    self.drop_coordinator(metadata);
                }
                true
            }
            err if err.is_connection_fatal() => {
                self.drop_coordinator(metadata);
                true
            }
            _ => false,
        }
    }

    async fn join_once(&mut self, metadata: &mut ClusterMetadata) -> Result<()> {
        if self.pending_sync.is_none() {
            self.join_generation(metadata).await?;
        }
        let sync = await_in_flight(&mut self.pending_sync).await?;
        if !sync.error_code.is_ok() {
            return Err(Error::Broker(sync.error_code));
        }

        self.assignment = sync
            .assignment
            .topic_partitions()
            .into_iter()
            .filter(|(topic, _)| self.topics.contains(topic))
            .map(|(topic, partition)| TopicPartition::new(topic, partition))
            .collect();
        self.state = MembershipState::Stable;
        self.last_heartbeat = Instant::now();
        tracing::info!(
            "Member {:?} | Assigned to {:?} in generation {}",
            self.member_id,
            self.assignment,
            self.generation_id
        );
        Ok(())
    }

    /// JoinGroup, then send the SyncGroup that completes the generation.
    async fn join_generation(&mut self, metadata: &mut ClusterMetadata) -> Result<()> {
        let coordinator = self.coordinator(metadata).await?;
        let wait = self.settings.rebalance_timeout + JOIN_SLACK;

        if self.pending_join.is_none() {
            self.state = MembershipState::Joining;
            tracing::info!(
                "Member {:?} | Joining group {} for generation {}",
                self.member_id,
                self.settings.group_id,
                self.generation_id
            );
            let request = JoinGroupRequest::new(
                &self.settings.group_id,
                self.settings.session_timeout_ms(),
                self.settings.rebalance_timeout_ms(),
                &self.member_id,
                vec![Protocol::new(ROUND_ROBIN_PROTOCOL, self.topics.clone())],
            );
            self.pending_join = Some((coordinator.send(&request)?, Instant::now() + wait));
        }
        let join = await_in_flight(&mut self.pending_join).await?;
        if join.error_code == KafkaCode::MemberIdRequired {
            self.member_id = join.member_id;
            return Err(Error::Broker(KafkaCode::MemberIdRequired));
        }
        if !join.error_code.is_ok() {
            return Err(Error::Broker(join.error_code));
        }
        self.member_id = join.member_id.clone();
        self.generation_id = join.generation_id;
        tracing::info!(
            "Member {:?} | group info: {} members, {:?} protocol, {:?} leader",
            self.member_id,
            join.members.len(),
            join.protocol_name,
            join.leader
        );

        let assignments = if join.is_leader() {
            leader_assignments(metadata, &join).await?
        } else {
            vec![]
        };

        self.state = MembershipState::Syncing;
        let request = SyncGroupRequest::new(
            &self.settings.group_id,
            self.generation_id,
            &self.member_id,
            assignments,
        );
        self.pending_sync = Some((coordinator.send(&request)?, Instant::now() + wait));
        Ok(())
    }

    /// The coordinator connection, looking the coordinator up when it is
    /// unknown or its connection is no longer usable.
    pub(crate) async fn coordinator(&mut self, metadata: &mut ClusterMetadata) -> Result<Connection> {
        if let Some(coordinator) = &self.coordinator {
            if coordinator.is_usable() {
                return Ok(coordinator.clone());
            }
        }
        let connection = metadata.any_connection().await?;
        let response = match connection
            .request(&FindCoordinatorRequest::new(&self.settings.group_id))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if err.is_connection_fatal() {
                    metadata.invalidate(connection.endpoint());
                }
                return Err(err);
            }
        };
        if !response.error_code.is_ok() {
            return Err(Error::Broker(response.error_code));
        }
        let port = u16::try_from(response.port).map_err(|_| {
            Error::Config(format!("coordinator port {} is out of range", response.port))
        })?;
        let endpoint = BrokerEndpoint::new(response.host, port, metadata.security_protocol());
        tracing::debug!(
            "Group {} is coordinated by node {} at {}",
            self.settings.group_id,
            response.node_id,
            endpoint
        );
        let coordinator = metadata.connection_to(&endpoint).await?;
        self.coordinator = Some(coordinator.clone());
        Ok(coordinator)
    }

    fn drop_coordinator(&mut self, metadata: &mut ClusterMetadata) {
        self.pending_join = None;
        self.pending_sync = None;
        if let Some(coordinator) = self.coordinator.take() {
            metadata.invalidate(coordinator.endpoint());
        }
    }

    /// Keep the membership alive. Moves to
    /// [`Rebalancing`](MembershipState::Rebalancing) when the session has
    /// expired or the coordinator asks the member to rejoin.
    pub async fn heartbeat(&mut self) -> Result<()> {
        if self.state != MembershipState::Stable {
            return Ok(());
        }
        if self.session_expired() {
            tracing::warn!(
                "Member {:?} | No successful heartbeat within {:?}",
                self.member_id,
                self.settings.session_timeout
            );
            self.mark_rebalance();
            return Ok(());
        }
        let Some(coordinator) = self.coordinator.clone() else {
            self.mark_rebalance();
            return Ok(());
        };

        tracing::debug!("Member {:?} | Heartbeat", self.member_id);
        let request = HeartbeatRequest::new(
            &self.settings.group_id,
            self.generation_id,
            &self.member_id,
        );
        let response = match coordinator.send(&request) {
            Ok(pending) => pending.response_timeout(self.settings.session_timeout).await,
            Err(err) => Err(err),
        };
        match response {
            Ok(response) if response.error_code.is_ok() => {
                self.last_heartbeat = Instant::now();
            }
            Ok(response) if response.error_code.requires_rejoin() => {
                if response.error_code == KafkaCode::UnknownMemberId {
                    self.member_id.clear();
                }
                self.mark_rebalance();
            }
            Ok(response) if response.error_code.invalidates_metadata() => {
                self.coordinator = None;
                self.mark_rebalance();
            }
            Ok(response) => return Err(Error::Broker(response.error_code)),
            // the session check catches a coordinator that stays away
            Err(err) if err.is_connection_fatal() => {
                tracing::warn!("Member {:?} | Heartbeat failed: {}", self.member_id, err);
                self.coordinator = None;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Commit `offsets` under `generation_id`.
    ///
    /// A coordinator answer that says the generation is over fails with
    /// [`Error::CommitFailed`] and marks the membership for rebalance.
    #[instrument(level = "debug", skip(self, metadata, offsets), fields(group = %self.settings.group_id))]
    pub async fn commit(
        &mut self,
        metadata: &mut ClusterMetadata,
        generation_id: i32,
        offsets: &BTreeMap<TopicPartition, i64>,
    ) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let coordinator = self.coordinator(metadata).await?;
        let mut request =
            OffsetCommitRequest::new(&self.settings.group_id, generation_id, &self.member_id);
        for (tp, offset) in offsets {
            request.add(&tp.topic, tp.partition, *offset, None);
        }
        let response = coordinator.request(&request).await?;
        match response.first_error() {
            None => {
                tracing::debug!(
                    "Member {:?} | Committed {} offsets in generation {}",
                    self.member_id,
                    offsets.len(),
                    generation_id
                );
                Ok(())
            }
            Some((topic, partition, code)) if code.requires_rejoin() => {
                let reason = format!(
                    "{}/{} returned {:?} for generation {}",
                    topic, partition, code, generation_id
                );
                self.mark_rebalance();
                Err(Error::CommitFailed(reason))
            }
            Some((_, _, code)) => {
                if code.invalidates_metadata() {
                    self.coordinator = None;
                }
                Err(Error::Broker(code))
            }
        }
    }

    /// The committed offsets of `partitions`. Partitions without one are
    /// left out.
    pub async fn committed(
        &mut self,
        metadata: &mut ClusterMetadata,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        if partitions.is_empty() {
            return Ok(HashMap::new());
        }
        let coordinator = self.coordinator(metadata).await?;
        let mut request = OffsetFetchRequest::new(&self.settings.group_id);
        for tp in partitions {
            request.add(&tp.topic, tp.partition);
        }
        let response = coordinator.request(&request).await?;
        if !response.error_code.is_ok() {
            return Err(Error::Broker(response.error_code));
        }
        Ok(partitions
            .iter()
            .filter_map(|tp| {
                response
                    .committed(&tp.topic, tp.partition)
                    .map(|offset| (tp.clone(), offset))
            })
            .collect())
    }

    /// Directly depart the group. The member is
    /// [`Dead`](MembershipState::Dead) afterwards even if the coordinator
    /// could not be told.
    pub async fn leave(&mut self) -> Result<()> {
        let result = match (&self.coordinator, self.member_id.is_empty()) {
            (Some(coordinator), false) => {
                tracing::info!(
                    "Member {:?} | Leaving group {}",
                    self.member_id,
                    self.settings.group_id
                );
                let request = LeaveGroupRequest::new(&self.settings.group_id, &self.member_id);
                match coordinator.request(&request).await {
                    Ok(response)
                        if response.error_code.is_ok() || response.error_code.requires_rejoin() =>
                    {
                        Ok(())
                    }
                    Ok(response) => Err(Error::Broker(response.error_code)),
                    Err(err) => Err(err),
                }
            }
            _ => Ok(()),
        };
        self.state = MembershipState::Dead;
        self.pending_join = None;
        self.pending_sync = None;
        self.assignment.clear();
        self.member_id.clear();
        self.generation_id = NO_GENERATION;
        self.coordinator = None;
        result
    }

    #[cfg(test)]
    pub(crate) fn assume_stable(
        &mut self,
        member_id: &str,
        generation_id: i32,
        assignment: impl IntoIterator<Item = TopicPartition>,
    ) {
        self.state = MembershipState::Stable;
        self.member_id = member_id.to_owned();
        self.generation_id = generation_id;
        self.assignment = assignment.into_iter().collect();
        self.last_heartbeat = Instant::now();
    }
}

/// Wait for the answer in `slot`. The slot is emptied once the answer, or
/// the failure to get one, is in.
async fn await_in_flight<T>(slot: &mut InFlight<T>) -> Result<T>
where
    T: TryFrom<bytes::Bytes, Error = Error>,
{
    let Some((pending, give_up)) = slot.as_mut() else {
        return Err(Error::ConnectionClosed);
    };
    let outcome = match timeout_at(*give_up, pending.wait()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::Timeout),
    };
    *slot = None;
    outcome
}

/// Partition assignment for every member, computed by the group leader.
async fn leader_assignments(
    metadata: &mut ClusterMetadata,
    join: &JoinGroupResponse,
) -> Result<Vec<Assignment>> {
    let mut members = Vec::with_capacity(join.members.len());
    for member in &join.members {
        let subscription = member.subscription()?;
        members.push(GroupMember {
            member_id: member.member_id.clone(),
            topics: subscription.topics,
        });
    }

    let mut partitions = BTreeMap::new();
    for topic in members.iter().flat_map(|m| m.topics.iter()) {
        if partitions.contains_key(topic) {
            continue;
        }
        metadata.ensure_topic(topic).await?;
        partitions.insert(topic.clone(), metadata.partitions(topic));
    }

    let assignments = assign(&join.protocol_name, &members, &partitions)?;
    tracing::info!("Leader | making assignments {:?}", assignments);
    Ok(assignments
        .into_iter()
        .map(|(member_id, assignment)| Assignment::new(&member_id, assignment))
        .collect())
}
