use tiller_types::{AgentSettings, ToolTier};

/// Static tool-name → tier table. Tier is configuration, never
/// inferred from arguments at runtime; `settings.tier_overrides` wins
/// over the built-ins.
pub fn tier_for(tool_name: &str, settings: &AgentSettings) -> ToolTier {
    if let Some(tier) = settings.tier_overrides.get(tool_name) {
        return *tier;
    }
    builtin_tier(tool_name)
}

fn builtin_tier(tool_name: &str) -> ToolTier {
    match tool_name {
        "fs_read" | "fs_list" | "fs_search" | "fs_glob" => ToolTier::Read,
        "fs_write" | "fs_apply_patch" => ToolTier::Write,
        "exec_run" => ToolTier::Exec,
        _ => ToolTier::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_classifies_known_tools() {
        let settings = AgentSettings::default();
        assert_eq!(tier_for("fs_read", &settings), ToolTier::Read);
        assert_eq!(tier_for("fs_apply_patch", &settings), ToolTier::Write);
        assert_eq!(tier_for("exec_run", &settings), ToolTier::Exec);
        assert_eq!(tier_for("telemetry_ping", &settings), ToolTier::Other);
    }

    #[test]
    fn overrides_take_precedence_over_builtins() {
        let mut settings = AgentSettings::default();
        settings
            .tier_overrides
            .insert("fs_read".to_string(), ToolTier::Exec);
        assert_eq!(tier_for("fs_read", &settings), ToolTier::Exec);
    }
}
