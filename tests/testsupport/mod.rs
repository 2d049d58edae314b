//! An in-process broker that speaks enough of the wire protocol for the
//! integration tests: one node, in-memory logs, single member groups and
//! a scripted SASL/GSSAPI exchange.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::env;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kerbka::codec::{decode_request, encode_response, FrameDecoder, RequestFrame, DEFAULT_MAX_FRAME_SIZE};
use kerbka::encode::ToByte;
use kerbka::prelude::{
    BrokerEndpoint, ClientConfig, ConsumeMessage, Consumer, ConsumerBuilder, ContextStep, Error,
    KerberosConfig, MembershipState, NegotiationError, Producer, ProducerBuilder, SecurityConfig, SecurityContext,
    SecurityContextProvider, SecurityProtocol,
};
use kerbka::protocol::records::{encode_record_set, parse_record_set};
use kerbka::protocol::RecordBatch;
use nombytes::NomBytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const KAFKA_BROKERS: &str = "KAFKA_BROKERS";
const KAFKA_TOPIC: &str = "KAFKA_TOPIC";

pub const HOST: &str = "127.0.0.1";
pub const NODE_ID: i32 = 0;

pub const PRODUCE: i16 = 0;
const FETCH: i16 = 1;
pub const LIST_OFFSETS: i16 = 2;
const METADATA: i16 = 3;
const OFFSET_COMMIT: i16 = 8;
const OFFSET_FETCH: i16 = 9;
const FIND_COORDINATOR: i16 = 10;
pub const JOIN_GROUP: i16 = 11;
const HEARTBEAT: i16 = 12;
const LEAVE_GROUP: i16 = 13;
const SYNC_GROUP: i16 = 14;
pub const SASL_HANDSHAKE: i16 = 17;
pub const SASL_AUTHENTICATE: i16 = 36;

const NONE: i16 = 0;
const OFFSET_OUT_OF_RANGE: i16 = 1;
const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
pub const LEADER_NOT_AVAILABLE: i16 = 5;
pub const NOT_LEADER_FOR_PARTITION: i16 = 6;
pub const REQUEST_TIMED_OUT: i16 = 7;
pub const MESSAGE_TOO_LARGE: i16 = 10;
const ILLEGAL_GENERATION: i16 = 22;
const UNKNOWN_MEMBER_ID: i16 = 25;
const REBALANCE_IN_PROGRESS: i16 = 27;
const UNSUPPORTED_SASL_MECHANISM: i16 = 33;
const SASL_AUTHENTICATION_FAILED: i16 = 58;
const MEMBER_ID_REQUIRED: i16 = 79;

/// Wrapped marker used by [`ScriptedGssapi`] and the broker side of the
/// exchange.
const WRAP_MARKER: u8 = 0xaa;
// RFC 4752 layer offer: "none" allowed, 4 KiB max message
const LAYER_OFFER: [u8; 4] = [0x07, 0x00, 0x10, 0x00];

/// Brokers from `KAFKA_BROKERS` and the topic from `KAFKA_TOPIC`, or
/// `None` when the live tests should be skipped.
pub fn live_cluster() -> Option<(String, String)> {
    let brokers = match env::var(KAFKA_BROKERS) {
        Ok(brokers) => brokers,
        Err(_) => {
            tracing::warn!("Skipping test because no {} is set", KAFKA_BROKERS);
            return None;
        }
    };
    let topic = match env::var(KAFKA_TOPIC) {
        Ok(topic) => topic,
        Err(_) => {
            tracing::warn!("Skipping test because no {} is set", KAFKA_TOPIC);
            return None;
        }
    };
    Some((brokers, topic))
}

/// How the broker answers `SaslHandshake` and `SaslAuthenticate`.
#[derive(Clone, Debug)]
pub struct SaslScript {
    pub mechanisms: Vec<String>,
    /// Tokens the client sends before its context is established. The
    /// security layer offer answers the last of them.
    pub context_rounds: u32,
    /// Reject the first token as bad credentials.
    pub reject: bool,
    pub session_lifetime_ms: i64,
}

impl SaslScript {
    pub fn gssapi(context_rounds: u32) -> Self {
        Self {
            mechanisms: vec!["GSSAPI".to_owned()],
            context_rounds,
            reject: false,
            session_lifetime_ms: 0,
        }
    }

    pub fn offering(mechanisms: &[&str]) -> Self {
        Self {
            mechanisms: mechanisms.iter().map(|m| m.to_string()).collect(),
            ..Self::gssapi(1)
        }
    }

    /// Keep challenging, never offering the security layer.
    pub fn endless() -> Self {
        Self::gssapi(u32::MAX)
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::gssapi(1)
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BrokerOptions {
    pub topics: Vec<(String, i32)>,
    pub sasl: Option<SaslScript>,
    /// Read requests but never answer them.
    pub silent: bool,
    /// Hold every JoinGroup answer back this long.
    pub join_delay: Option<Duration>,
}

impl BrokerOptions {
    pub fn topic(mut self, name: &str, partitions: i32) -> Self {
        self.topics.push((name.to_owned(), partitions));
        self
    }

    pub fn sasl(mut self, script: SaslScript) -> Self {
        self.sasl = Some(script);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn join_delay(mut self, delay: Duration) -> Self {
        self.join_delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct Log {
    batches: Vec<RecordBatch>,
    next_offset: i64,
}

#[derive(Debug, Default)]
struct Group {
    generation: i32,
    member_id: Option<String>,
    assignment: Bytes,
    rebalance_pending: bool,
    offsets: HashMap<(String, i32), i64>,
    next_member: u32,
}

#[derive(Debug, Default)]
struct State {
    topics: BTreeMap<String, i32>,
    logs: HashMap<(String, i32), Log>,
    groups: HashMap<String, Group>,
    received: Vec<i16>,
    connections: usize,
    /// Error codes the next requests of an API answer with, one per request.
    faults: HashMap<i16, VecDeque<i16>>,
}

impl State {
    fn next_fault(&mut self, api_key: i16) -> Option<i16> {
        self.faults.get_mut(&api_key).and_then(VecDeque::pop_front)
    }
}

struct Shared {
    state: Mutex<State>,
    data: Notify,
    options: BrokerOptions,
    port: u16,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// A broker listening on an ephemeral localhost port until dropped.
pub struct MockBroker {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockBroker {
    pub async fn start(options: BrokerOptions) -> MockBroker {
        let listener = TcpListener::bind((HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = State {
            topics: options.topics.iter().cloned().collect(),
            ..State::default()
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            data: Notify::new(),
            options,
            port,
        });
        let task = tokio::spawn(accept(listener, Arc::clone(&shared)));
        MockBroker { shared, task }
    }

    pub fn security_protocol(&self) -> SecurityProtocol {
        match self.shared.options.sasl {
            Some(_) => SecurityProtocol::SaslPlaintext,
            None => SecurityProtocol::Plaintext,
        }
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(HOST, self.shared.port, self.security_protocol())
    }

    /// A plaintext client configuration pointing at this broker.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(vec![self.endpoint()]).with_request_timeout(Duration::from_secs(5))
    }

    /// Answer the next requests of `api_key` with `codes`, one code per
    /// request and applied to every partition in it. Nothing is written.
    pub fn fail_next(&self, api_key: i16, codes: &[i16]) {
        let mut state = self.shared.lock();
        state.faults.entry(api_key).or_default().extend(codes);
    }

    /// How many requests of `api_key` arrived.
    pub fn count(&self, api_key: i16) -> usize {
        self.shared.lock().received.iter().filter(|&&key| key == api_key).count()
    }

    /// API keys of every request received, in arrival order.
    pub fn received(&self) -> Vec<i16> {
        self.shared.lock().received.clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.lock().connections
    }

    pub fn log_end_offset(&self, topic: &str, partition: i32) -> i64 {
        self.shared
            .lock()
            .logs
            .get(&(topic.to_owned(), partition))
            .map_or(0, |log| log.next_offset)
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .lock()
            .groups
            .get(group)
            .and_then(|g| g.offsets.get(&(topic.to_owned(), partition)).copied())
    }

    pub fn generation(&self, group: &str) -> i32 {
        self.shared.lock().groups.get(group).map_or(0, |g| g.generation)
    }

    /// Start a rebalance as if another member had joined. Heartbeats
    /// answer `RebalanceInProgress` until the member joins again; commits
    /// under the current generation are still accepted.
    pub fn trigger_rebalance(&self, group: &str) {
        let mut state = self.shared.lock();
        state.groups.entry(group.to_owned()).or_default().rebalance_pending = true;
    }

    /// Finish a rebalance the member missed: its generation is stale.
    pub fn advance_generation(&self, group: &str) {
        let mut state = self.shared.lock();
        state.groups.entry(group.to_owned()).or_default().generation += 1;
    }
}

pub async fn producer(config: ClientConfig, topic: &str) -> Producer {
    ProducerBuilder::new(config)
        .topics(vec![topic.to_owned()])
        .linger(Duration::from_millis(2))
        .build()
        .await
        .unwrap()
}

pub fn consumer(config: ClientConfig, group: &str, topic: &str) -> ConsumerBuilder {
    ConsumerBuilder::new(config, group, vec![topic.to_owned()])
        .session_timeout(Duration::from_secs(10))
        .heartbeat_interval(Duration::from_secs(1))
        .max_wait(Duration::from_millis(50))
}

/// Poll until `count` records arrived or `timeout` passed.
pub async fn consume(consumer: &mut Consumer, count: usize, timeout: Duration) -> Vec<ConsumeMessage> {
    let deadline = Instant::now() + timeout;
    let mut records = vec![];
    while records.len() < count && Instant::now() < deadline {
        let batch = consumer
            .poll(count - records.len(), Duration::from_millis(100))
            .await
            .unwrap();
        records.extend(batch);
    }
    records
}

/// Poll until `consumer` is stable in a generation after `after` and has a
/// position for every assigned partition. Returns what the polls read.
pub async fn settle(consumer: &mut Consumer, after: i32) -> Vec<ConsumeMessage> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut records = vec![];
    loop {
        records.extend(consumer.poll(10, Duration::from_millis(100)).await.unwrap());
        let assignment = consumer.assignment();
        if consumer.state() == MembershipState::Stable
            && consumer.generation_id() > after
            && !assignment.is_empty()
            && assignment.iter().all(|tp| consumer.position(tp).is_some())
        {
            return records;
        }
        assert!(Instant::now() < deadline, "consumer never settled, {:?}", consumer.state());
    }
}

/// Poll until `consumer` has joined its group.
pub async fn joined(consumer: &mut Consumer) -> Vec<ConsumeMessage> {
    settle(consumer, -1).await
}

/// Client side GSSAPI stand in. Completes after `complete_after` steps,
/// never when `None`, and wraps by prefixing a marker byte.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedGssapi {
    pub complete_after: Option<u32>,
}

struct ScriptedContext {
    steps: u32,
    complete_after: Option<u32>,
}

impl SecurityContextProvider for ScriptedGssapi {
    fn create(&self, _: &KerberosConfig, _: &str) -> kerbka::prelude::Result<Box<dyn SecurityContext>> {
        Ok(Box::new(ScriptedContext {
            steps: 0,
            complete_after: self.complete_after,
        }))
    }
}

impl SecurityContext for ScriptedContext {
    fn step(&mut self, _input: &[u8]) -> kerbka::prelude::Result<ContextStep> {
        self.steps += 1;
        let complete = self.complete_after == Some(self.steps);
        Ok(ContextStep {
            token: (!complete).then(|| Bytes::from(format!("token-{}", self.steps))),
            complete,
        })
    }

    fn wrap_token(&mut self, message: &[u8]) -> kerbka::prelude::Result<Bytes> {
        let mut out = vec![WRAP_MARKER];
        out.extend_from_slice(message);
        Ok(Bytes::from(out))
    }

    fn unwrap_token(&mut self, message: &[u8]) -> kerbka::prelude::Result<Bytes> {
        match message.split_first() {
            Some((&WRAP_MARKER, rest)) => Ok(Bytes::copy_from_slice(rest)),
            _ => Err(Error::Negotiation(NegotiationError::SecurityContext(
                "token was not wrapped".to_owned(),
            ))),
        }
    }
}

/// Kerberos settings backed by [`ScriptedGssapi`].
pub fn kerberos(complete_after: Option<u32>) -> SecurityConfig {
    SecurityConfig::kerberos(
        KerberosConfig::new("client@EXAMPLE.COM", "/etc/security/client.keytab"),
        Arc::new(ScriptedGssapi { complete_after }),
    )
}

async fn accept(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(_) => return,
        };
        shared.lock().connections += 1;
        tokio::spawn(serve(socket, Arc::clone(&shared)));
    }
}

#[derive(Default)]
struct SaslSession {
    authenticated: bool,
    tokens: u32,
    layer_offered: bool,
}

async fn serve(socket: TcpStream, shared: Arc<Shared>) {
    let (mut reader, mut writer) = socket.into_split();
    let (responses, mut outgoing) = mpsc::unbounded_channel::<Bytes>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::default();
    let mut sasl = SaslSession {
        authenticated: shared.options.sasl.is_none(),
        ..SaslSession::default()
    };

    'connection: loop {
        loop {
            let frame = match decoder.decode() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => break 'connection,
            };
            let request = decode_request(frame).unwrap();
            shared.lock().received.push(request.api_key);
            if shared.options.silent {
                continue;
            }

            let body = match request.api_key {
                SASL_HANDSHAKE | SASL_AUTHENTICATE => match &shared.options.sasl {
                    Some(script) => Some(authenticate(script, &mut sasl, &request)),
                    None => break 'connection,
                },
                // nothing but SASL before the exchange completes
                _ if !sasl.authenticated => break 'connection,
                FETCH => {
                    let shared = Arc::clone(&shared);
                    let responses = responses.clone();
                    tokio::spawn(async move {
                        let body = fetch(&shared, request.body).await;
                        let frame = encode_response(request.correlation_id, &body, DEFAULT_MAX_FRAME_SIZE);
                        let _ = responses.send(frame.unwrap());
                    });
                    continue;
                }
                JOIN_GROUP if shared.options.join_delay.is_some() => {
                    let shared = Arc::clone(&shared);
                    let responses = responses.clone();
                    tokio::spawn(async move {
                        if let Some(delay) = shared.options.join_delay {
                            tokio::time::sleep(delay).await;
                        }
                        let body = join_group(&shared, &request.client_id, request.body);
                        let frame = encode_response(request.correlation_id, &body, DEFAULT_MAX_FRAME_SIZE);
                        let _ = responses.send(frame.unwrap());
                    });
                    continue;
                }
                _ => handle(&shared, &request),
            };
            if let Some(body) = body {
                let frame = encode_response(request.correlation_id, &body, DEFAULT_MAX_FRAME_SIZE).unwrap();
                if responses.send(frame).is_err() {
                    break 'connection;
                }
            }
        }
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    drop(responses);
    writer_task.abort();
}

fn handle(shared: &Shared, request: &RequestFrame) -> Option<Bytes> {
    let body = request.body.clone();
    match request.api_key {
        PRODUCE => produce(shared, body),
        LIST_OFFSETS => Some(list_offsets(shared, body)),
        METADATA => Some(metadata(shared, body)),
        OFFSET_COMMIT => Some(offset_commit(shared, body)),
        OFFSET_FETCH => Some(offset_fetch(shared, body)),
        FIND_COORDINATOR => Some(find_coordinator(shared)),
        JOIN_GROUP => Some(join_group(shared, &request.client_id, body)),
        SYNC_GROUP => Some(sync_group(shared, body)),
        HEARTBEAT => Some(heartbeat(shared, body)),
        LEAVE_GROUP => Some(leave_group(shared, body)),
        other => panic!("mock broker does not speak API {}", other),
    }
}

fn authenticate(script: &SaslScript, session: &mut SaslSession, request: &RequestFrame) -> Bytes {
    let mut body = request.body.clone();
    let mut out = BytesMut::new();
    if request.api_key == SASL_HANDSHAKE {
        let mechanism = get_str(&mut body);
        let code = if script.mechanisms.contains(&mechanism) {
            NONE
        } else {
            UNSUPPORTED_SASL_MECHANISM
        };
        out.put_i16(code);
        put_strings(&mut out, &script.mechanisms);
        return out.freeze();
    }

    let token = get_bytes(&mut body);
    let (code, reply) = if script.reject {
        (SASL_AUTHENTICATION_FAILED, Bytes::new())
    } else if session.layer_offered {
        // the client's choice: wrapped, "no layer", authzid
        if token.len() >= 5 && token[0] == WRAP_MARKER && token[1] == 0x01 {
            session.authenticated = true;
            (NONE, Bytes::new())
        } else {
            (SASL_AUTHENTICATION_FAILED, Bytes::new())
        }
    } else {
        session.tokens += 1;
        if session.tokens >= script.context_rounds {
            session.layer_offered = true;
            let mut offer = vec![WRAP_MARKER];
            offer.extend_from_slice(&LAYER_OFFER);
            (NONE, Bytes::from(offer))
        } else {
            (NONE, Bytes::from_static(b"challenge"))
        }
    };

    out.put_i16(code);
    if code == NONE {
        out.put_i16(-1);
    } else {
        put_str(&mut out, "Authentication failed: invalid credentials");
    }
    reply.encode(&mut out).unwrap();
    out.put_i64(if session.authenticated {
        script.session_lifetime_ms
    } else {
        0
    });
    out.freeze()
}

fn metadata(shared: &Shared, mut body: Bytes) -> Bytes {
    let requested = get_nullable_strings(&mut body);
    let state = shared.lock();
    let names: Vec<String> = requested.unwrap_or_else(|| state.topics.keys().cloned().collect());

    let mut out = BytesMut::new();
    out.put_i32(1);
    out.put_i32(NODE_ID);
    put_str(&mut out, HOST);
    out.put_i32(i32::from(shared.port));
    out.put_i16(-1);
    out.put_i32(NODE_ID);
    out.put_i32(names.len() as i32);
    for name in &names {
        let partitions = state.topics.get(name).copied();
        out.put_i16(partitions.map_or(UNKNOWN_TOPIC_OR_PARTITION, |_| NONE));
        put_str(&mut out, name);
        out.put_i8(0);
        let count = partitions.unwrap_or(0);
        out.put_i32(count);
        for partition in 0..count {
            out.put_i16(NONE);
            out.put_i32(partition);
            out.put_i32(NODE_ID);
            out.put_i32(1);
            out.put_i32(NODE_ID);
            out.put_i32(1);
            out.put_i32(NODE_ID);
        }
    }
    out.freeze()
}

fn produce(shared: &Shared, mut body: Bytes) -> Option<Bytes> {
    let _transactional_id = get_nullable_str(&mut body);
    let acks = body.get_i16();
    let _timeout_ms = body.get_i32();

    let mut results = vec![];
    {
        let mut state = shared.lock();
        let fault = state.next_fault(PRODUCE);
        for _ in 0..body.get_i32() {
            let topic = get_str(&mut body);
            let mut partitions = vec![];
            for _ in 0..body.get_i32() {
                let index = body.get_i32();
                let records = get_bytes(&mut body);
                if let Some(code) = fault {
                    partitions.push((index, code, -1));
                    continue;
                }
                if !state.topics.get(&topic).map_or(false, |&n| (0..n).contains(&index)) {
                    partitions.push((index, UNKNOWN_TOPIC_OR_PARTITION, -1));
                    continue;
                }
                let (_, batches) = parse_record_set(NomBytes::new(records)).unwrap();
                let log = state.logs.entry((topic.clone(), index)).or_default();
                let base_offset = log.next_offset;
                for mut batch in batches {
                    batch.base_offset = log.next_offset;
                    log.next_offset = batch.last_offset() + 1;
                    log.batches.push(batch);
                }
                partitions.push((index, NONE, base_offset));
            }
            results.push((topic, partitions));
        }
    }
    shared.data.notify_waiters();

    if acks == 0 {
        return None;
    }
    let mut out = BytesMut::new();
    out.put_i32(results.len() as i32);
    for (topic, partitions) in &results {
        put_str(&mut out, topic);
        out.put_i32(partitions.len() as i32);
        for (index, code, base_offset) in partitions {
            out.put_i32(*index);
            out.put_i16(*code);
            out.put_i64(*base_offset);
            out.put_i64(-1);
        }
    }
    out.put_i32(0);
    Some(out.freeze())
}

struct FetchPartition {
    topic: String,
    partition: i32,
    offset: i64,
}

async fn fetch(shared: &Shared, mut body: Bytes) -> Bytes {
    let _replica = body.get_i32();
    let max_wait = Duration::from_millis(body.get_i32().max(0) as u64);
    let _min_bytes = body.get_i32();
    let _max_bytes = body.get_i32();
    let _isolation_level = body.get_i8();
    let mut wanted = vec![];
    for _ in 0..body.get_i32() {
        let topic = get_str(&mut body);
        for _ in 0..body.get_i32() {
            let partition = body.get_i32();
            let offset = body.get_i64();
            let _partition_max_bytes = body.get_i32();
            wanted.push(FetchPartition {
                topic: topic.clone(),
                partition,
                offset,
            });
        }
    }

    let deadline = Instant::now() + max_wait;
    loop {
        let produced = shared.data.notified();
        if let Some(response) = fetch_response(shared, &wanted, Instant::now() >= deadline) {
            return response;
        }
        let _ = tokio::time::timeout_at(deadline, produced).await;
    }
}

/// `None` while there is nothing to report and the wait is not over.
fn fetch_response(shared: &Shared, wanted: &[FetchPartition], force: bool) -> Option<Bytes> {
    let state = shared.lock();
    let mut ready = false;
    let mut by_topic: BTreeMap<&str, Vec<(i32, i16, i64, Vec<RecordBatch>)>> = BTreeMap::new();
    for p in wanted {
        let known = state
            .topics
            .get(&p.topic)
            .map_or(false, |&n| (0..n).contains(&p.partition));
        let entry = if !known {
            (p.partition, UNKNOWN_TOPIC_OR_PARTITION, -1, vec![])
        } else {
            let (hw, batches) = match state.logs.get(&(p.topic.clone(), p.partition)) {
                Some(log) => (log.next_offset, log.batches.as_slice()),
                None => (0, &[][..]),
            };
            if p.offset < 0 || p.offset > hw {
                (p.partition, OFFSET_OUT_OF_RANGE, hw, vec![])
            } else {
                let batches: Vec<RecordBatch> = batches
                    .iter()
                    .filter(|b| b.last_offset() >= p.offset)
                    .cloned()
                    .collect();
                (p.partition, NONE, hw, batches)
            }
        };
        ready |= entry.1 != NONE || !entry.3.is_empty();
        by_topic.entry(p.topic.as_str()).or_default().push(entry);
    }
    if !ready && !force {
        return None;
    }

    let mut out = BytesMut::new();
    out.put_i32(0);
    out.put_i32(by_topic.len() as i32);
    for (topic, partitions) in by_topic {
        put_str(&mut out, topic);
        out.put_i32(partitions.len() as i32);
        for (partition, code, hw, batches) in partitions {
            out.put_i32(partition);
            out.put_i16(code);
            out.put_i64(hw);
            out.put_i64(hw);
            out.put_i32(-1);
            encode_record_set(&batches).unwrap().encode(&mut out).unwrap();
        }
    }
    Some(out.freeze())
}

fn list_offsets(shared: &Shared, mut body: Bytes) -> Bytes {
    let _replica = body.get_i32();
    let mut state = shared.lock();
    let fault = state.next_fault(LIST_OFFSETS);
    let mut out = BytesMut::new();
    let topics = body.get_i32();
    out.put_i32(topics);
    for _ in 0..topics {
        let topic = get_str(&mut body);
        put_str(&mut out, &topic);
        let partitions = body.get_i32();
        out.put_i32(partitions);
        for _ in 0..partitions {
            let partition = body.get_i32();
            let timestamp = body.get_i64();
            let end = state
                .logs
                .get(&(topic.clone(), partition))
                .map_or(0, |log| log.next_offset);
            out.put_i32(partition);
            out.put_i16(fault.unwrap_or(NONE));
            out.put_i64(-1);
            // -2 asks for the earliest offset; nothing is ever truncated
            out.put_i64(if timestamp == -2 { 0 } else { end });
        }
    }
    out.freeze()
}

fn find_coordinator(shared: &Shared) -> Bytes {
    let mut out = BytesMut::new();
    out.put_i16(NONE);
    out.put_i32(NODE_ID);
    put_str(&mut out, HOST);
    out.put_i32(i32::from(shared.port));
    out.freeze()
}

fn join_group(shared: &Shared, client_id: &str, mut body: Bytes) -> Bytes {
    let group_id = get_str(&mut body);
    let _session_timeout = body.get_i32();
    let _rebalance_timeout = body.get_i32();
    let member_id = get_str(&mut body);
    let _protocol_type = get_str(&mut body);
    let mut protocols = vec![];
    for _ in 0..body.get_i32() {
        let name = get_str(&mut body);
        let metadata = get_bytes(&mut body);
        protocols.push((name, metadata));
    }

    let mut state = shared.lock();
    let group = state.groups.entry(group_id).or_default();
    let mut out = BytesMut::new();
    out.put_i32(0);
    if member_id.is_empty() {
        group.next_member += 1;
        out.put_i16(MEMBER_ID_REQUIRED);
        out.put_i32(-1);
        put_str(&mut out, "");
        put_str(&mut out, "");
        put_str(&mut out, &format!("{}-{}", client_id, group.next_member));
        out.put_i32(0);
        return out.freeze();
    }

    // the newest member takes the group over
    let (protocol, metadata) = protocols.into_iter().next().unwrap();
    group.generation += 1;
    group.rebalance_pending = false;
    group.member_id = Some(member_id.clone());
    out.put_i16(NONE);
    out.put_i32(group.generation);
    put_str(&mut out, &protocol);
    put_str(&mut out, &member_id);
    put_str(&mut out, &member_id);
    out.put_i32(1);
    put_str(&mut out, &member_id);
    metadata.encode(&mut out).unwrap();
    out.freeze()
}

/// Error for a group request from `member_id` in `generation`, if any.
fn group_error(
    group: Option<&Group>,
    generation: i32,
    member_id: &str,
    during_rebalance: bool,
) -> Option<i16> {
    let group = match group {
        Some(group) => group,
        None => return Some(UNKNOWN_MEMBER_ID),
    };
    if group.member_id.as_deref() != Some(member_id) {
        Some(UNKNOWN_MEMBER_ID)
    } else if group.generation != generation {
        Some(ILLEGAL_GENERATION)
    } else if group.rebalance_pending && !during_rebalance {
        Some(REBALANCE_IN_PROGRESS)
    } else {
        None
    }
}

fn sync_group(shared: &Shared, mut body: Bytes) -> Bytes {
    let group_id = get_str(&mut body);
    let generation = body.get_i32();
    let member_id = get_str(&mut body);
    let mut assignments = HashMap::new();
    for _ in 0..body.get_i32() {
        let member = get_str(&mut body);
        let assignment = get_bytes(&mut body);
        assignments.insert(member, assignment);
    }

    let mut state = shared.lock();
    let mut out = BytesMut::new();
    out.put_i32(0);
    match group_error(state.groups.get(&group_id), generation, &member_id, false) {
        Some(code) => {
            out.put_i16(code);
            out.put_i32(0);
        }
        None => {
            let group = state.groups.get_mut(&group_id).unwrap();
            if let Some(assignment) = assignments.remove(&member_id) {
                group.assignment = assignment;
            }
            out.put_i16(NONE);
            group.assignment.encode(&mut out).unwrap();
        }
    }
    out.freeze()
}

fn heartbeat(shared: &Shared, mut body: Bytes) -> Bytes {
    let group_id = get_str(&mut body);
    let generation = body.get_i32();
    let member_id = get_str(&mut body);
    let state = shared.lock();
    let code = group_error(state.groups.get(&group_id), generation, &member_id, false).unwrap_or(NONE);
    let mut out = BytesMut::new();
    out.put_i16(code);
    out.freeze()
}

fn leave_group(shared: &Shared, mut body: Bytes) -> Bytes {
    let group_id = get_str(&mut body);
    let member_id = get_str(&mut body);
    let mut state = shared.lock();
    if let Some(group) = state.groups.get_mut(&group_id) {
        if group.member_id.as_deref() == Some(member_id.as_str()) {
            group.member_id = None;
        }
    }
    let mut out = BytesMut::new();
    out.put_i16(NONE);
    out.freeze()
}

fn offset_commit(shared: &Shared, mut body: Bytes) -> Bytes {
    let group_id = get_str(&mut body);
    let generation = body.get_i32();
    let member_id = get_str(&mut body);
    let _retention_ms = body.get_i64();

    let mut state = shared.lock();
    // generation -1 with no member is a commit from outside the group
    let code = if generation == -1 && member_id.is_empty() {
        None
    } else {
        group_error(state.groups.get(&group_id), generation, &member_id, true)
    };
    let group = state.groups.entry(group_id).or_default();

    let mut out = BytesMut::new();
    let topics = body.get_i32();
    out.put_i32(topics);
    for _ in 0..topics {
        let topic = get_str(&mut body);
        put_str(&mut out, &topic);
        let partitions = body.get_i32();
        out.put_i32(partitions);
        for _ in 0..partitions {
            let partition = body.get_i32();
            let offset = body.get_i64();
            let _metadata = get_nullable_str(&mut body);
            if code.is_none() {
                group.offsets.insert((topic.clone(), partition), offset);
            }
            out.put_i32(partition);
            out.put_i16(code.unwrap_or(NONE));
        }
    }
    out.freeze()
}

fn offset_fetch(shared: &Shared, mut body: Bytes) -> Bytes {
    let group_id = get_str(&mut body);
    let state = shared.lock();
    let offsets = state.groups.get(&group_id).map(|g| &g.offsets);

    let mut out = BytesMut::new();
    let topics = body.get_i32();
    out.put_i32(topics.max(0));
    for _ in 0..topics {
        let topic = get_str(&mut body);
        put_str(&mut out, &topic);
        let partitions = body.get_i32();
        out.put_i32(partitions);
        for _ in 0..partitions {
            let partition = body.get_i32();
            let committed = offsets
                .and_then(|o| o.get(&(topic.clone(), partition)))
                .copied()
                .unwrap_or(-1);
            out.put_i32(partition);
            out.put_i64(committed);
            out.put_i16(-1);
            out.put_i16(NONE);
        }
    }
    out.put_i16(NONE);
    out.freeze()
}

fn get_str(body: &mut Bytes) -> String {
    let len = body.get_i16();
    let raw = body.split_to(len as usize);
    String::from_utf8(raw.to_vec()).unwrap()
}

fn get_nullable_str(body: &mut Bytes) -> Option<String> {
    let len = body.get_i16();
    if len < 0 {
        return None;
    }
    let raw = body.split_to(len as usize);
    Some(String::from_utf8(raw.to_vec()).unwrap())
}

fn get_nullable_strings(body: &mut Bytes) -> Option<Vec<String>> {
    let count = body.get_i32();
    if count < 0 {
        return None;
    }
    Some((0..count).map(|_| get_str(body)).collect())
}

fn get_bytes(body: &mut Bytes) -> Bytes {
    let len = body.get_i32();
    if len < 0 {
        return Bytes::new();
    }
    body.split_to(len as usize)
}

fn put_str(out: &mut BytesMut, s: &str) {
    s.encode(out).unwrap();
}

fn put_strings(out: &mut BytesMut, strings: &[String]) {
    strings.encode(out).unwrap();
}
