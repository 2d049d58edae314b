//! Error types for the client.
//!
//! Every fallible operation returns [`Result`]. Callers decide what to do
//! next with [`Error::disposition`], which sorts every failure into one of
//! three buckets: retry as is, reconfigure and retry, or give up.
use num_derive::FromPrimitive;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// DNS resolution, TCP connect or TLS setup failed.
    #[error("could not connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("SASL negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// The byte stream is not a valid sequence of frames.
    #[error("framing error: {0}")]
    Framing(String),

    /// A request could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A frame arrived intact but its body did not parse as the expected message.
    #[error("could not parse {0}")]
    Parsing(String),

    /// The connection went away before the response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// An error code returned by the broker for a single request.
    #[error("broker returned {0:?}")]
    Broker(KafkaCode),

    /// The group rebalanced away from the offsets being committed.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("no leader known for {topic}/{partition}")]
    NoLeader { topic: String, partition: i32 },

    #[error("operation timed out")]
    Timeout,

    #[error("socket error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The producer or consumer has been closed.
    #[error("client is closed")]
    ClientClosed,

    #[error("payload is not valid JSON: {0}")]
    Json(String),
}

/// Failures of the SASL/GSSAPI exchange.
///
/// None of these can be retried on the connection that produced them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("broker does not offer GSSAPI (offered: {offered:?})")]
    UnsupportedMechanism { offered: Vec<String> },

    #[error("token exchange did not complete within {rounds} rounds")]
    Exhausted { rounds: u32 },

    #[error("credentials rejected: {0}")]
    AuthenticationFailed(String),

    #[error("GSSAPI is not available on this host")]
    MechanismUnavailable,

    #[error("security context error: {0}")]
    SecurityContext(String),

    #[error("security layer negotiation failed: {0}")]
    SecurityLayer(String),

    #[error("connection is not authenticated yet")]
    NotAuthenticated,

    #[error("negotiator cannot be reused after {0:?}")]
    AlreadyRun(crate::network::sasl::NegotiationState),
}

/// What a caller should do about an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The same operation may succeed if attempted again, possibly on a
    /// fresh connection.
    Retry,
    /// Something has to change first: refresh metadata, rejoin the group,
    /// or fix credentials.
    Reconfigure,
    /// Retrying will not help.
    GiveUp,
}

impl Error {
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::Connect { .. }
            | Error::ConnectionClosed
            | Error::Timeout
            | Error::Io(_)
            | Error::NoLeader { .. } => Disposition::Retry,
            Error::Negotiation(_) | Error::CommitFailed(_) | Error::Config(_) => {
                Disposition::Reconfigure
            }
            Error::Broker(code) => code.disposition(),
            Error::Framing(_)
            | Error::Encoding(_)
            | Error::Parsing(_)
            | Error::ClientClosed
            | Error::Json(_) => Disposition::GiveUp,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    /// Errors after which the connection that produced them should be
    /// replaced.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::Io(_)
                | Error::Framing(_)
                | Error::Timeout
                | Error::Connect { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.kind())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

/// Various errors reported by a remote Kafka server.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive)]
pub enum KafkaCode {
    /// An unexpected server error
    Unknown = -1,
    /// No error
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition
    OffsetOutOfRange = 1,
    /// This indicates that a message contents does not match its CRC
    CorruptMessage = 2,
    /// This request is for a topic or partition that does not exist
    /// on this broker.
    UnknownTopicOrPartition = 3,
    /// The message has a negative size
    InvalidMessageSize = 4,
    /// This error is thrown if we are in the middle of a leadership
    /// election and there is currently no leader for this partition
    /// and hence it is unavailable for writes.
    LeaderNotAvailable = 5,
    /// This error is thrown if the client attempts to send messages
    /// to a replica that is not the leader for some partition. It
    /// indicates that the clients metadata is out of date.
    NotLeaderForPartition = 6,
    /// This error is thrown if the request exceeds the user-specified
    /// time limit in the request.
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    ReplicaNotAvailable = 9,
    /// The server has a configurable maximum message size to avoid
    /// unbounded memory allocation. This error is thrown if the
    /// client attempt to produce a message larger than this maximum.
    MessageTooLarge = 10,
    StaleControllerEpoch = 11,
    OffsetMetadataTooLarge = 12,
    NetworkException = 13,
    /// The broker returns this error code for an offset fetch request
    /// if it is still loading offsets (after a leader change for that
    /// offsets topic partition), or in response to group membership
    /// requests (such as heartbeats) when group metadata is being
    /// loaded by the coordinator.
    GroupLoadInProgress = 14,
    /// The broker returns this error code for group coordinator
    /// requests, offset commits, and most group management requests
    /// if the offsets topic has not yet been created, or if the group
    /// coordinator is not active.
    GroupCoordinatorNotAvailable = 15,
    /// The broker returns this error code if it receives an offset
    /// fetch or commit request for a group that it is not a
    /// coordinator for.
    NotCoordinatorForGroup = 16,
    InvalidTopic = 17,
    RecordListTooLarge = 18,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    InvalidRequiredAcks = 21,
    /// Returned from group membership requests (such as heartbeats)
    /// when the generation id provided in the request is not the
    /// current generation.
    IllegalGeneration = 22,
    InconsistentGroupProtocol = 23,
    InvalidGroupId = 24,
    /// Returned from group requests (offset commits/fetches,
    /// heartbeats, etc) when the memberId is not in the current
    /// generation.
    UnknownMemberId = 25,
    InvalidSessionTimeout = 26,
    /// Returned in heartbeat requests when the coordinator has begun
    /// rebalancing the group. This indicates to the client that it
    /// should rejoin the group.
    RebalanceInProgress = 27,
    InvalidCommitOffsetSize = 28,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
    ClusterAuthorizationFailed = 31,
    InvalidTimestamp = 32,
    UnsupportedSaslMechanism = 33,
    IllegalSaslState = 34,
    UnsupportedVersion = 35,
    TopicAlreadyExists = 36,
    InvalidPartitions = 37,
    InvalidReplicationFactor = 38,
    InvalidReplicaAssignment = 39,
    InvalidConfig = 40,
    NotController = 41,
    InvalidRequest = 42,
    UnsupportedForMessageFormat = 43,
    PolicyViolation = 44,
    OutOfOrderSequenceNumber = 45,
    DuplicateSequenceNumber = 46,
    InvalidProducerEpoch = 47,
    InvalidTxnState = 48,
    InvalidProducerIdMapping = 49,
    InvalidTransactionTimeout = 50,
    ConcurrentTransactions = 51,
    TransactionCoordinatorFenced = 52,
    TransactionalIdAuthorizationFailed = 53,
    SecurityDisabled = 54,
    OperationNotAttempted = 55,
    KafkaStorageError = 56,
    LogDirNotFound = 57,
    SaslAuthenticationFailed = 58,
    UnknownProducerId = 59,
    ReassignmentInProgress = 60,
    DelegationTokenAuthDisabled = 61,
    DelegationTokenNotFound = 62,
    DelegationTokenOwnerMismatch = 63,
    DelegationTokenRequestNotAllowed = 64,
    DelegationTokenAuthorizationFailed = 65,
    DelegationTokenExpired = 66,
    InvalidPrincipalType = 67,
    NonEmptyGroup = 68,
    GroupIdNotFound = 69,
    FetchSessionIdNotFound = 70,
    InvalidFetchSessionEpoch = 71,
    ListenerNotFound = 72,
    TopicDeletionDisabled = 73,
    FencedLeaderEpoch = 74,
    UnknownLeaderEpoch = 75,
    UnsupportedCompressionType = 76,
    StaleBrokerEpoch = 77,
    OffsetNotAvailable = 78,
    MemberIdRequired = 79,
    PreferredLeaderNotAvailable = 80,
    GroupMaxSizeReached = 81,
    FencedInstanceId = 82,
}

impl KafkaCode {
    pub fn is_ok(&self) -> bool {
        *self == KafkaCode::None
    }

    /// Codes the broker marks as transient: the same request may succeed
    /// later, after a metadata refresh at most.
    pub fn is_retriable(&self) -> bool {
        use KafkaCode::*;
        matches!(
            self,
            CorruptMessage
                | UnknownTopicOrPartition
                | LeaderNotAvailable
                | NotLeaderForPartition
                | RequestTimedOut
                | BrokerNotAvailable
                | ReplicaNotAvailable
                | NetworkException
                | GroupLoadInProgress
                | GroupCoordinatorNotAvailable
                | NotCoordinatorForGroup
                | NotEnoughReplicas
                | NotEnoughReplicasAfterAppend
                | KafkaStorageError
                | FencedLeaderEpoch
                | UnknownLeaderEpoch
                | OffsetNotAvailable
                | PreferredLeaderNotAvailable
        )
    }

    /// Codes that mean the consumer's group membership is no longer valid.
    pub fn requires_rejoin(&self) -> bool {
        use KafkaCode::*;
        matches!(
            self,
            IllegalGeneration | UnknownMemberId | RebalanceInProgress | MemberIdRequired
        )
    }

    /// Codes that mean the cached leader or coordinator is stale.
    pub fn invalidates_metadata(&self) -> bool {
        use KafkaCode::*;
        matches!(
            self,
            UnknownTopicOrPartition
                | LeaderNotAvailable
                | NotLeaderForPartition
                | FencedLeaderEpoch
                | UnknownLeaderEpoch
                | GroupCoordinatorNotAvailable
                | NotCoordinatorForGroup
        )
    }

    pub fn disposition(&self) -> Disposition {
        if self.is_retriable() {
            Disposition::Retry
        } else if self.requires_rejoin() {
            Disposition::Reconfigure
        } else {
            Disposition::GiveUp
        }
    }
}
