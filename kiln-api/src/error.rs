use std::sync::Arc;

pub type KilnResult<T> = Result<T, KilnError>;

/// Which descriptor heap ran out of space
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KilnDescriptorHeapType {
    /// Constant buffer, shader resource and unordered access views
    Resource,
    Sampler,
    RenderTarget,
    DepthStencil,
}

/// Generic error that contains all the different kinds of errors that may occur when using the API
#[derive(Debug, Clone)]
pub enum KilnError {
    StringError(String),
    IoError(Arc<std::io::Error>),

    /// A descriptor or request violates an invariant. Nothing was changed.
    ValidationError(String),

    /// The native API failed even though the input was valid. Nothing was created.
    BackendError(String),

    /// The device was removed or reset. Every later call on the device fails with this.
    DeviceLost,

    /// The API was used incorrectly (recording after end, draw outside a render pass, double
    /// release, fence value from another queue, ...)
    PreconditionViolation(String),

    DescriptorHeapFull {
        heap: KilnDescriptorHeapType,
        requested: u32,
        capacity: u32,
    },
}

impl KilnError {
    pub fn is_device_lost(&self) -> bool {
        match self {
            KilnError::DeviceLost => true,
            _ => false,
        }
    }
}

impl std::error::Error for KilnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            KilnError::IoError(ref e) => Some(&**e),
            _ => None,
        }
    }
}

impl core::fmt::Display for KilnError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            KilnError::StringError(ref e) => e.fmt(fmt),
            KilnError::IoError(ref e) => e.fmt(fmt),
            KilnError::ValidationError(ref e) => write!(fmt, "Validation error: {}", e),
            KilnError::BackendError(ref e) => write!(fmt, "Backend error: {}", e),
            KilnError::DeviceLost => write!(fmt, "The device was lost"),
            KilnError::PreconditionViolation(ref e) => {
                write!(fmt, "Precondition violation: {}", e)
            }
            KilnError::DescriptorHeapFull {
                heap,
                requested,
                capacity,
            } => write!(
                fmt,
                "{:?} descriptor heap is full (requested {} descriptors, capacity {})",
                heap, requested, capacity
            ),
        }
    }
}

impl From<&str> for KilnError {
    fn from(str: &str) -> Self {
        KilnError::StringError(str.to_string())
    }
}

impl From<String> for KilnError {
    fn from(string: String) -> Self {
        KilnError::StringError(string)
    }
}

impl From<std::io::Error> for KilnError {
    fn from(error: std::io::Error) -> Self {
        KilnError::IoError(Arc::new(error))
    }
}
