//! Error types for change tracking and relationship fixup.

use std::fmt;

/// The primary error type for all relmodel operations.
#[derive(Debug)]
pub enum Error {
    /// A key property of a non-`Added` entry would change
    KeyReadOnly(KeyReadOnlyError),
    /// Two instances claim the same identity and no resolution policy applies
    IdentityConflict(IdentityConflictError),
    /// An instance is tracked under several owned entity types
    AmbiguousDependent(DependentError),
    /// An untracked instance of a shared owned class was looked up directly
    UntrackedDependent(DependentError),
    /// The same instance is referenced by more than one owner
    DuplicateDependent(DuplicateDependentError),
    /// A required foreign key was severed and the relationship does not cascade
    ConceptualNull(ConceptualNullError),
    /// A key contains `Null` and cannot be generated
    NullKey(NullKeyError),
    /// Model lookup or validation errors
    Model(ModelError),
    /// The requested operation is not valid in the current state
    InvalidOperation(String),
    /// Configuration errors
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct KeyReadOnlyError {
    pub entity_type: String,
    pub property: String,
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub entity_type: String,
    /// Rendered key values, present only with sensitive data logging
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DependentError {
    /// CLR-level class name of the instance
    pub class: String,
    /// Entity types the instance is (or could be) tracked as
    pub entity_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DuplicateDependentError {
    pub entity_type: String,
    pub other_entity_type: String,
}

#[derive(Debug, Clone)]
pub struct ConceptualNullError {
    pub entity_type: String,
    pub principal_type: String,
    /// Rendered key values, present only with sensitive data logging
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NullKeyError {
    pub entity_type: String,
    pub property: String,
}

#[derive(Debug, Clone)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    /// No entity type with this name
    UnknownEntityType,
    /// No class with this name
    UnknownClass,
    /// No property with this name on the entity type
    UnknownProperty,
    /// No navigation with this name on the entity type
    UnknownNavigation,
    /// Name is not a valid identifier
    InvalidName,
    /// Name declared twice
    Duplicate,
    /// Foreign key arity or shape does not match the principal key
    ForeignKeyMismatch,
    /// Entity type declares no key
    MissingKey,
    /// Value or object does not fit the model
    Mismatch,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Construct a model error.
    pub fn model(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Error::Model(ModelError {
            kind,
            message: message.into(),
        })
    }

    /// Construct an invalid-operation error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidOperation(message.into())
    }

    /// The model error kind, if this is a model error.
    pub fn model_kind(&self) -> Option<ModelErrorKind> {
        match self {
            Error::Model(m) => Some(m.kind),
            _ => None,
        }
    }

    /// Is this one of the identity errors (conflict, ambiguity, untracked lookup)?
    pub fn is_identity_error(&self) -> bool {
        matches!(
            self,
            Error::IdentityConflict(_)
                | Error::AmbiguousDependent(_)
                | Error::UntrackedDependent(_)
                | Error::DuplicateDependent(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeyReadOnly(e) => write!(f, "Key read-only: {e}"),
            Error::IdentityConflict(e) => write!(f, "Identity conflict: {e}"),
            Error::AmbiguousDependent(e) => write!(
                f,
                "Ambiguous dependent: instance of '{}' is tracked as {}; use the owner's navigation entry instead",
                e.class,
                e.entity_types.join(", ")
            ),
            Error::UntrackedDependent(e) => write!(
                f,
                "Untracked dependent: '{}' is only mapped as owned type(s) {}; use the owner's navigation entry instead",
                e.class,
                e.entity_types.join(", ")
            ),
            Error::DuplicateDependent(e) => write!(f, "Duplicate dependent: {e}"),
            Error::ConceptualNull(e) => write!(f, "Conceptual null: {e}"),
            Error::NullKey(e) => write!(f, "Null key: {e}"),
            Error::Model(e) => write!(f, "Model error: {}", e.message),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for KeyReadOnlyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "property '{}.{}' is part of a key and cannot be modified once tracked",
            self.entity_type, self.property
        )
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(
                f,
                "another instance of '{}' with key {} is already being tracked",
                self.entity_type, key
            ),
            None => write!(
                f,
                "another instance of '{}' with the same key is already being tracked",
                self.entity_type
            ),
        }
    }
}

impl fmt::Display for DuplicateDependentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance tracked as '{}' is also referenced as '{}' by another owner",
            self.entity_type, self.other_entity_type
        )
    }
}

impl fmt::Display for ConceptualNullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the association between '{}' and '{}'",
            self.principal_type, self.entity_type
        )?;
        if let Some(key) = &self.key {
            write!(f, " (dependent key {key})")?;
        }
        write!(
            f,
            " was severed but the required foreign key cannot be set to null"
        )
    }
}

impl fmt::Display for NullKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key property '{}.{}' is null and is not value-generated",
            self.entity_type, self.property
        )
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ModelError> for Error {
    fn from(err: ModelError) -> Self {
        Error::Model(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for relmodel operations.
pub type Result<T> = std::result::Result<T, Error>;
