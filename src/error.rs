use thiserror::Error;

/// Error types for queue-engine operations
///
/// Covers every failure class the engine reports, from configuration
/// validation to per-queue structural problems. Attempt-level failures
/// (peer busy, request refused, wrapup active) are *not* errors: they are
/// recovered inside the ring loop and never surface through this type.
///
/// # Examples
///
/// ```
/// use acd_engine::{AcdError, Result};
///
/// fn add_member(interface: &str) -> Result<()> {
///     if interface.is_empty() {
///         return Err(AcdError::invalid_input("member interface cannot be empty"));
///     }
///     Ok(())
/// }
///
/// match add_member("") {
///     Ok(_) => println!("member added"),
///     Err(AcdError::InvalidInput(msg)) => println!("rejected: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum AcdError {
    /// Queue-related errors
    ///
    /// Queue full, unknown queue name, waiting-list inconsistencies.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Member-related errors
    ///
    /// Duplicate interface, provenance conflicts, unknown member on a
    /// mutating operation.
    #[error("Member error: {0}")]
    Member(String),

    /// Device-state errors
    ///
    /// Missing state key, registry lookup failures.
    #[error("Device error: {0}")]
    Device(String),

    /// Transport (channel driver) errors
    ///
    /// Failures reported by the external transport while placing or
    /// controlling channels, when they cannot be absorbed by the ring loop.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Dispatch orchestration errors
    ///
    /// Coordination problems above the individual subsystems.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Configuration validation errors
    ///
    /// Unknown strategy names, invalid timing parameters, empty queue names.
    /// The mutating operation is rejected and existing state is unchanged.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence adapter errors from the external key/value store.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid input to a management operation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested queue, member, or rule set could not be located.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempt to create something that already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Unexpected internal errors
    ///
    /// Indicates a bug; the engine keeps running, the operation fails.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AcdError {
    fn from(err: anyhow::Error) -> Self {
        // Unexpected errors from lower-level collaborators land here.
        Self::Internal(err.to_string())
    }
}

impl AcdError {
    /// Create a new Queue error with the provided message
    ///
    /// # Examples
    ///
    /// ```
    /// use acd_engine::AcdError;
    ///
    /// let error = AcdError::queue("queue is full");
    /// println!("{}", error);  // Prints: Queue error: queue is full
    /// ```
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a new Member error with the provided message
    pub fn member<S: Into<String>>(msg: S) -> Self {
        Self::Member(msg.into())
    }

    /// Create a new Device error with the provided message
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }

    /// Create a new Transport error with the provided message
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new Dispatch error with the provided message
    pub fn dispatch<S: Into<String>>(msg: S) -> Self {
        Self::Dispatch(msg.into())
    }

    /// Create a new Configuration error with the provided message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new Persistence error with the provided message
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a new InvalidInput error with the provided message
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new NotFound error with the provided message
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new AlreadyExists error with the provided message
    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a new Internal error with the provided message
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for queue-engine operations
///
/// Type alias for `std::result::Result<T, AcdError>` used throughout the
/// crate.
///
/// # Examples
///
/// ```
/// use acd_engine::{Result, AcdError};
///
/// fn lookup_queue(name: &str) -> Result<String> {
///     if name.is_empty() {
///         return Err(AcdError::not_found("queue name is empty"));
///     }
///     Ok(name.to_string())
/// }
///
/// assert!(lookup_queue("support").is_ok());
/// assert!(lookup_queue("").is_err());
/// ```
pub type Result<T> = std::result::Result<T, AcdError>;
