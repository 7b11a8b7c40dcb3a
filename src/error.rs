pub type LaminaResult<T> = Result<T, LaminaError>;

#[derive(thiserror::Error, Debug)]
pub enum LaminaError {
    /// Illegal stack mutation. The mutation is rejected and the stack is
    /// left unchanged.
    #[error("validation error: {0}")]
    Validation(String),

    /// A material fragment's sockets do not match the stack's channels.
    #[error("incompatible material: {0}")]
    IncompatibleMaterial(String),

    /// A fragment bound as a custom blend mode has the wrong socket
    /// signature.
    #[error("incompatible custom blend fragment: {0}")]
    IncompatibleCustomFragment(String),

    /// Internal invariant violation during graph synthesis. The previously
    /// compiled graph stays active.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Rasterization failed or only partially completed; bake state is
    /// rolled back.
    #[error("bake failure: {0}")]
    Bake(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LaminaError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn incompatible_material(msg: impl Into<String>) -> Self {
        Self::IncompatibleMaterial(msg.into())
    }

    pub fn incompatible_custom_fragment(msg: impl Into<String>) -> Self {
        Self::IncompatibleCustomFragment(msg.into())
    }

    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    pub fn bake(msg: impl Into<String>) -> Self {
        Self::Bake(msg.into())
    }

    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }
}
