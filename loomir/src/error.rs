use thiserror::Error;
use uuid::Uuid;

use crate::modules::operand::{ExtId, GlobalId, Label, Name};

/// Structural errors reported by the module verifier.
#[derive(Debug, Error)]
pub enum IrError {
    #[error("function '{function}' has no entry block")]
    MissingEntryBlock { function: String },

    #[error("function '{function}': terminator of {block} targets unknown block {target}")]
    UnknownBlock { function: String, block: Label, target: Label },

    #[error("function '{function}': SSA name {name} is defined more than once")]
    DuplicateName { function: String, name: Name },

    #[error("function '{function}': operand references undefined SSA name {name}")]
    UndefinedName { function: String, name: Name },

    #[error("function '{function}': reference to unknown global {global:?}")]
    UnknownGlobal { function: String, global: GlobalId },

    #[error("function '{function}': reference to unknown external {ext:?}")]
    UnknownExternal { function: String, ext: ExtId },

    #[error("function '{function}': call references unknown function {callee}")]
    UnknownFunction { function: String, callee: Uuid },

    #[error("constructor list references unknown function")]
    UnknownCtor,
}

pub type IrResult<T> = Result<T, IrError>;
