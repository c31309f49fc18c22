use crmpilot_agent::crm::crm_registry;
use crmpilot_agent::tools::{ToolAccess, ToolDescriptor};
use serde::Serialize;
use serde_json::Value;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct ToolEntry {
    name: String,
    description: String,
    access: ToolAccess,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct CatalogReport {
    total_tools: usize,
    tools: Vec<ToolEntry>,
}

pub fn run(json_output: bool) -> CommandResult {
    let registry = match crm_registry() {
        Ok(registry) => registry,
        Err(error) => return CommandResult::failure("tools", "registry", error.to_string(), 1),
    };

    let tools: Vec<ToolEntry> = registry.list().into_iter().map(entry).collect();
    let report = CatalogReport { total_tools: tools.len(), tools };

    if json_output {
        return match serde_json::to_string_pretty(&report) {
            Ok(output) => CommandResult { exit_code: 0, output },
            Err(error) => CommandResult::failure("tools", "serialization", error.to_string(), 1),
        };
    }

    CommandResult { exit_code: 0, output: render_human(&report) }
}

fn entry(descriptor: ToolDescriptor) -> ToolEntry {
    ToolEntry {
        input_schema: descriptor.input_schema(),
        name: descriptor.name,
        description: descriptor.description,
        access: descriptor.access,
    }
}

fn render_human(report: &CatalogReport) -> String {
    let mut lines = vec![format!("{} tools registered:", report.total_tools)];

    for tool in &report.tools {
        let access = match tool.access {
            ToolAccess::Read => "read",
            ToolAccess::Write => "write",
        };
        let required = tool.input_schema["required"]
            .as_array()
            .map(|names| names.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", "))
            .unwrap_or_default();

        if required.is_empty() {
            lines.push(format!("- {} [{access}]: {}", tool.name, tool.description));
        } else {
            lines.push(format!(
                "- {} [{access}] (requires {required}): {}",
                tool.name, tool.description
            ));
        }
    }

    lines.join("\n")
}
