//! Compilation options.

use serde::{Deserialize, Serialize};

/// Knobs for one compilation. The defaults are what the driver binary uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Upper bound on optimizer rounds before giving up on the fixpoint.
    pub max_optimizer_rounds: usize,
    /// Skip the rewrite passes entirely; lowering and induction analysis
    /// still run. Useful when debugging the raw lowered graph.
    pub skip_optimizer: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            max_optimizer_rounds: 64,
            skip_optimizer: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CompileOptions::default();
        assert_eq!(options.max_optimizer_rounds, 64);
        assert!(!options.skip_optimizer);
    }

    #[test]
    fn test_json_round_trip() {
        let options = CompileOptions {
            max_optimizer_rounds: 8,
            skip_optimizer: true,
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: CompileOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(options, back);
    }
}
