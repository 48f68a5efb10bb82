use thiserror::Error;

/// Failures of the instrumentation engine.
///
/// Everything here aborts the whole-module transformation; locally
/// recoverable conditions (odd-width accesses, unknown trip counts,
/// unextractable allocation sizes) are excluded at their site instead and
/// never surface as errors.
#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("failed to parse instrumentation profile '{file}': {source}")]
    Profile {
        source: toml::de::Error,
        file: String,
    },

    #[error("failed to read instrumentation profile '{file}': {source}")]
    ProfileIo {
        source: std::io::Error,
        file: String,
    },

    #[error("symbol '{symbol}' is defined by both the program and tool module '{tool_module}'")]
    SymbolConflict { symbol: String, tool_module: String },

    #[error("event category {category} has id {id} without a metadata record")]
    MissingMetadata { category: String, id: u64 },

    #[error("instrumented module failed structural verification: {0}")]
    InstrumenterDefect(#[from] loomir::error::IrError),
}

pub type WeaveResult<T> = Result<T, WeaveError>;
