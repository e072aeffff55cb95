use std::error::Error as StdError;
use std::fmt;

/// Reason codes carried by verify errors
///
/// These are machine readable so that callers (and tests) can distinguish the exact check that
/// rejected a method without matching on message text.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VerifyErrorKind {
    StackOverflow,
    StackUnderflow,
    StackExpectCat1,
    StackBadType,
    LocalsOverflow,
    LocalsBadType,
    LocalsUnderflow,
    TargetBadType,
    BackBranchUninit,
    SeqBadType,
    ExpectClass,
    ExpectThrowable,
    BadLookupSwitch,
    BadLdc,
    BaloadBadType,
    AaloadBadType,
    BastoreBadType,
    AastoreBadType,
    FieldBadType,
    ExpectMethodRef,
    ArgsNotEnough,
    ArgsBadType,
    ExpectInvokeSpecial,
    ExpectNew,
    ExpectUninit,
    BadInstr,
    ExpectArray,
    MultiANewArray,
    ExpectNoRetVal,
    RetValBadType,
    ExpectRetVal,
    ReturnUninitThis,
    BadStackMap,
    FallThrough,
    ExpectZero,
    NargsMismatch,
    InvokeSpecial,
    BadInitCall,
    ExpectFieldRef,
    FinalMethodOverride,
    MiddleOfByteCode,
    BadLiveness,
}

impl VerifyErrorKind {
    pub fn description(&self) -> &'static str {
        use VerifyErrorKind::*;
        match self {
            StackOverflow => "stack overflow",
            StackUnderflow => "stack underflow",
            StackExpectCat1 => "expecting a category 1 value on the stack",
            StackBadType => "bad type on stack",
            LocalsOverflow => "too many locals",
            LocalsBadType => "bad type in local",
            LocalsUnderflow => "local index is negative",
            TargetBadType => "branch target has no stack map entry",
            BackBranchUninit => "backward branch with uninitialized object",
            SeqBadType => "unreachable code without a stack map entry",
            ExpectClass => "expecting a class constant",
            ExpectThrowable => "expecting a throwable",
            BadLookupSwitch => "unsorted lookupswitch",
            BadLdc => "bad constant for ldc",
            BaloadBadType => "baload on a non byte or boolean array",
            AaloadBadType => "aaload on a non object array",
            BastoreBadType => "bastore on a non byte or boolean array",
            AastoreBadType => "aastore of an incompatible value",
            FieldBadType => "incompatible field type",
            ExpectMethodRef => "expecting a method reference",
            ArgsNotEnough => "not enough arguments",
            ArgsBadType => "bad argument type",
            ExpectInvokeSpecial => "initializer must be called with invokespecial",
            ExpectNew => "expecting an uninitialized object",
            ExpectUninit => "constructor called on an initialized object",
            BadInstr => "illegal instruction",
            ExpectArray => "expecting an array",
            MultiANewArray => "bad dimensions in multianewarray",
            ExpectNoRetVal => "unexpected return value",
            RetValBadType => "bad return type",
            ExpectRetVal => "missing return value",
            ReturnUninitThis => "returning from a constructor without initializing this",
            BadStackMap => "inconsistent stack map",
            FallThrough => "falling off the end of the code",
            ExpectZero => "non zero padding bytes",
            NargsMismatch => "argument count mismatch",
            InvokeSpecial => "bad invokespecial target",
            BadInitCall => "bad constructor call",
            ExpectFieldRef => "expecting a field reference",
            FinalMethodOverride => "final method overridden",
            MiddleOfByteCode => "code ends in the middle of an instruction",
            BadLiveness => "liveness attribute disagrees with analysis",
        }
    }
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Kinds of (recoverable) linkage errors
///
/// These mirror the JVM error classes thrown by class loading and verification. A failure of this
/// sort aborts the translation of one class, but leaves that class reloadable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkageErrorKind {
    ClassFormatError,
    UnsupportedClassVersionError,
    NoClassDefFoundError,
    ClassCircularityError,
    IncompatibleClassChangeError,
    NoSuchFieldError,
    NoSuchMethodError,
    IllegalAccessError,
    InstantiationError,
    AbstractMethodError,
    VerifyError(VerifyErrorKind),
    UntranslatableCode,
    LinkageError,
}

impl fmt::Display for LinkageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkageErrorKind::VerifyError(_) => f.write_str("VerifyError"),
            LinkageErrorKind::UntranslatableCode => f.write_str("untranslatable code"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Link or verify failure, with the context frames accumulated while it propagated
#[derive(Debug)]
pub struct LinkageError {
    pub kind: LinkageErrorKind,
    pub detail: String,

    /// Innermost context first (eg. `ip 12`, then `A.f(I)I`, then `class A`)
    pub context: Vec<String>,

    /// Lower level failure that caused this one
    pub cause: Option<Box<dyn StdError + 'static>>,
}

impl LinkageError {
    pub fn new(kind: LinkageErrorKind, detail: impl Into<String>) -> LinkageError {
        LinkageError {
            kind,
            detail: detail.into(),
            context: vec![],
            cause: None,
        }
    }

    pub fn verify(kind: VerifyErrorKind, detail: impl Into<String>) -> LinkageError {
        LinkageError::new(LinkageErrorKind::VerifyError(kind), detail)
    }

    pub fn class_format(detail: impl Into<String>) -> LinkageError {
        LinkageError::new(LinkageErrorKind::ClassFormatError, detail)
    }

    pub fn untranslatable(detail: impl Into<String>) -> LinkageError {
        LinkageError::new(LinkageErrorKind::UntranslatableCode, detail)
    }

    pub fn with_cause(mut self, cause: impl StdError + 'static) -> LinkageError {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Reason code, if this is a verify error
    pub fn verify_kind(&self) -> Option<VerifyErrorKind> {
        match self.kind {
            LinkageErrorKind::VerifyError(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for LinkageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            LinkageErrorKind::VerifyError(kind) if self.detail.is_empty() => {
                write!(f, "VerifyError: {}", kind)?
            }
            LinkageErrorKind::VerifyError(kind) => {
                write!(f, "VerifyError: {}: {}", kind, self.detail)?
            }
            kind => write!(f, "{}: {}", kind, self.detail)?,
        }
        for frame in &self.context {
            write!(f, "\n    in {}", frame)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "\n  caused by: {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for LinkageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref()
    }
}

/// Violation of one of the translator's own invariants
///
/// Never a property of the input: these are bugs, and are reported as such.
#[derive(Debug)]
pub struct AssertionFailed {
    pub message: String,
    pub context: Vec<String>,
}

impl AssertionFailed {
    pub fn new(message: impl Into<String>) -> AssertionFailed {
        AssertionFailed {
            message: message.into(),
            context: vec![],
        }
    }
}

impl fmt::Display for AssertionFailed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "assertion failed: {}", self.message)?;
        for frame in &self.context {
            write!(f, "\n    in {}", frame)?;
        }
        Ok(())
    }
}

impl StdError for AssertionFailed {}

#[derive(Debug)]
pub enum TranslationError {
    Linkage(LinkageError),
    Assertion(AssertionFailed),
    IoError(std::io::Error),
}

impl TranslationError {
    pub fn as_linkage(&self) -> Option<&LinkageError> {
        match self {
            TranslationError::Linkage(err) => Some(err),
            _ => None,
        }
    }

    pub fn verify_kind(&self) -> Option<VerifyErrorKind> {
        self.as_linkage().and_then(LinkageError::verify_kind)
    }

    fn push_context(&mut self, frame: String) {
        match self {
            TranslationError::Linkage(err) => err.context.push(frame),
            TranslationError::Assertion(err) => err.context.push(frame),
            TranslationError::IoError(_) => (),
        }
    }
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TranslationError::Linkage(err) => err.fmt(f),
            TranslationError::Assertion(err) => err.fmt(f),
            TranslationError::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl StdError for TranslationError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TranslationError::Linkage(err) => err.source(),
            TranslationError::Assertion(_) => None,
            TranslationError::IoError(err) => Some(err),
        }
    }
}

impl From<LinkageError> for TranslationError {
    fn from(err: LinkageError) -> TranslationError {
        TranslationError::Linkage(err)
    }
}

impl From<AssertionFailed> for TranslationError {
    fn from(err: AssertionFailed) -> TranslationError {
        TranslationError::Assertion(err)
    }
}

impl From<std::io::Error> for TranslationError {
    fn from(err: std::io::Error) -> TranslationError {
        TranslationError::IoError(err)
    }
}

pub type Result<T> = std::result::Result<T, TranslationError>;

/// Attach a context frame to an error as it propagates outwards
pub trait ErrorContext<T> {
    fn context<F: FnOnce() -> String>(self, frame: F) -> Result<T>;
}

impl<T, E: Into<TranslationError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context<F: FnOnce() -> String>(self, frame: F) -> Result<T> {
        self.map_err(|err| {
            let mut err = err.into();
            err.push_context(frame());
            err
        })
    }
}

/// Fail with a verify error unless the condition holds
pub fn verify(condition: bool, kind: VerifyErrorKind) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(LinkageError::verify(kind, "").into())
    }
}

/// Like `verify`, but with a lazily computed detail message
pub fn verify_with<F: FnOnce() -> String>(
    condition: bool,
    kind: VerifyErrorKind,
    detail: F,
) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(LinkageError::verify(kind, detail()).into())
    }
}

/// Fail with an untranslatable code error unless the condition holds
pub fn verify_translatable(condition: bool, detail: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(LinkageError::untranslatable(detail).into())
    }
}

/// Internal consistency check
pub fn assert_that(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(AssertionFailed::new(message).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn context_accumulates_innermost_first() {
        let res: Result<()> = Err(LinkageError::verify(VerifyErrorKind::StackUnderflow, "").into());
        let err = res
            .context(|| String::from("ip 3"))
            .context(|| String::from("A.f()V"))
            .unwrap_err();
        let linkage = err.as_linkage().unwrap();
        assert_eq!(linkage.context, vec!["ip 3", "A.f()V"]);
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::StackUnderflow));
    }

    #[test]
    fn assertion_failures_are_not_verify_errors() {
        let err = assert_that(false, "broken invariant").unwrap_err();
        assert!(err.as_linkage().is_none());
        assert!(err.to_string().contains("broken invariant"));
    }

    #[test]
    fn cause_is_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = LinkageError::class_format("truncated").with_cause(io);
        assert!(err.source().is_some());
        assert!(err.to_string().contains("caused by"));
    }
}
