use crate::error::BuildError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// External programs the orchestrator may shell out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    CMake,
    Bazel,
    Shell,
    CCompiler,
    CxxCompiler,
    Minijail,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::CMake,
        Tool::Bazel,
        Tool::Shell,
        Tool::CCompiler,
        Tool::CxxCompiler,
        Tool::Minijail,
    ];

    pub fn binary_name(self) -> &'static str {
        match self {
            Tool::CMake => "cmake",
            Tool::Bazel => "bazel",
            Tool::Shell => "sh",
            Tool::CCompiler => "clang",
            Tool::CxxCompiler => "clang++",
            Tool::Minijail => "minijail0",
        }
    }
}

/// Resolved tool paths, handed to the builders and the runner at construction.
///
/// Nothing below the orchestrator looks up `PATH` on its own; tests build an
/// `Environment` pointing at fake tool scripts instead.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    tools: HashMap<Tool, PathBuf>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves every known tool through `PATH`. Missing tools are simply absent.
    pub fn detect() -> Self {
        let mut env = Self::new();
        for tool in Tool::ALL {
            match which::which(tool.binary_name()) {
                Ok(path) => {
                    debug!(tool = tool.binary_name(), path = %path.display(), "resolved tool");
                    env.tools.insert(tool, path);
                }
                Err(e) => debug!(tool = tool.binary_name(), "tool not found: {e}"),
            }
        }
        env
    }

    pub fn with_tool(mut self, tool: Tool, path: impl Into<PathBuf>) -> Self {
        self.tools.insert(tool, path.into());
        self
    }

    pub fn tool(&self, tool: Tool) -> Option<&Path> {
        self.tools.get(&tool).map(PathBuf::as_path)
    }

    pub fn require(&self, tool: Tool) -> Result<&Path, BuildError> {
        self.tool(tool).ok_or_else(|| BuildError::ToolMissing {
            tool: tool.binary_name().to_string(),
            reason: "not found in PATH".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_tools_are_returned_and_missing_ones_fail() {
        let env = Environment::new().with_tool(Tool::Shell, "/bin/sh");
        assert_eq!(env.tool(Tool::Shell), Some(Path::new("/bin/sh")));
        assert!(env.tool(Tool::Bazel).is_none());

        match env.require(Tool::CMake) {
            Err(BuildError::ToolMissing { tool, .. }) => assert_eq!(tool, "cmake"),
            other => panic!("Expected ToolMissing, got {other:?}"),
        }
    }
}
