/// An error that can occur when registering or clearing a [`crate::FaultAction`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The fault kind is not one we handle, or a platform call was handed an
    /// invalid argument
    #[error("invalid argument")]
    InvalidArgument,
    /// The platform ran out of a resource, eg. port names
    #[error("out of resources")]
    OutOfResources,
    /// A user reference count would have overflowed
    #[error("reference count overflow")]
    RefCountOverflow,
    /// A right or name already exists
    #[error("already exists")]
    AlreadyExists,
    /// Any other platform error, the raw code is kept as is
    #[error("unsupported platform error {0}")]
    Unsupported(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(target_os = "macos")]
impl Error {
    /// Maps a `kern_return_t` failure to its closest equivalent
    pub(crate) fn from_kern(kr: mach2::kern_return::kern_return_t) -> Self {
        use mach2::kern_return as kr;

        match kr {
            kr::KERN_NO_SPACE => Self::OutOfResources,
            kr::KERN_INVALID_CAPABILITY => Self::InvalidArgument,
            kr::KERN_UREFS_OVERFLOW => Self::RefCountOverflow,
            kr::KERN_NAME_EXISTS | kr::KERN_RIGHT_EXISTS => Self::AlreadyExists,
            other => Self::Unsupported(other),
        }
    }
}
