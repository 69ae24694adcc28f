//! SARIF 2.1.0 report of a run: one result per edit, one result per method whose control flow
//! analysis failed, and the scanned artifacts.

use std::collections::BTreeSet;

use serde_json::json;
use serde_sarif::sarif::{
    Artifact, ArtifactLocation, Invocation, Location, LogicalLocation, Message, PhysicalLocation,
    ReportingDescriptor, Result as SarifResult, Run, SCHEMA_URL, Sarif, Tool, ToolComponent,
};

use crate::passes::{Edit, EditTarget};
use crate::program::Program;

pub const CFG_ANALYSIS: &str = "CFG_ANALYSIS";

const TOOL_NAME: &str = "bytetwist";
const INFORMATION_URI: &str = "https://github.com/bytetwist/bytetwist";

pub fn build_invocation(arguments: Vec<String>, successful: bool) -> Invocation {
    let command_line = arguments.join(" ");
    Invocation::builder()
        .execution_successful(successful)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

/// One result per method of `program` whose last control flow analysis failed.
pub fn cfg_results(program: &Program) -> Vec<SarifResult> {
    program
        .method_ids()
        .into_iter()
        .filter_map(|id| {
            let (owner, name, descriptor, error) = program.method(id).and_then(|method| {
                let error = method.cfg_error()?.to_string();
                Some((
                    method.owner(),
                    method.name().to_string(),
                    method.descriptor().to_string(),
                    error,
                ))
            })?;
            let class_name = program.class_name(owner)?;
            Some(
                SarifResult::builder()
                    .rule_id(CFG_ANALYSIS.to_string())
                    .message(result_message(format!(
                        "Control flow analysis failed: {error}"
                    )))
                    .locations(vec![method_location(&class_name, &name, &descriptor)])
                    .build(),
            )
        })
        .collect()
}

pub fn edit_results(edits: &[Edit]) -> Vec<SarifResult> {
    edits
        .iter()
        .map(|edit| {
            SarifResult::builder()
                .rule_id(edit.pass.to_string())
                .message(result_message(edit.message.clone()))
                .locations(vec![edit_location(&edit.target)])
                .build()
        })
        .collect()
}

pub fn build_sarif(
    artifacts: Vec<Artifact>,
    results: Vec<SarifResult>,
    invocation: Invocation,
) -> Sarif {
    let rule_ids: BTreeSet<String> = results
        .iter()
        .filter_map(|result| result.rule_id.clone())
        .collect();
    let rules: Vec<ReportingDescriptor> = rule_ids
        .into_iter()
        .map(|id| ReportingDescriptor::builder().id(id).build())
        .collect();
    let driver = if rules.is_empty() {
        ToolComponent::builder()
            .name(TOOL_NAME)
            .information_uri(INFORMATION_URI)
            .build()
    } else {
        ToolComponent::builder()
            .name(TOOL_NAME)
            .information_uri(INFORMATION_URI)
            .rules(rules)
            .build()
    };
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}

fn edit_location(target: &EditTarget) -> Location {
    match target {
        EditTarget::Class(name) => class_location(name),
        EditTarget::Field { owner, name } => {
            let logical = LogicalLocation::builder()
                .name(format!("{owner}.{name}"))
                .kind("member")
                .build();
            Location::builder().logical_locations(vec![logical]).build()
        }
        EditTarget::Method {
            owner,
            name,
            descriptor,
        } => method_location(owner, name, descriptor),
        EditTarget::File(uri) => {
            let physical = PhysicalLocation::builder()
                .artifact_location(ArtifactLocation::builder().uri(uri.clone()).build())
                .build();
            Location::builder().physical_location(physical).build()
        }
    }
}

fn method_location(class_name: &str, method_name: &str, descriptor: &str) -> Location {
    let logical = LogicalLocation::builder()
        .name(format!("{class_name}.{method_name}{descriptor}"))
        .kind("function")
        .build();
    Location::builder().logical_locations(vec![logical]).build()
}

fn class_location(class_name: &str) -> Location {
    let logical = LogicalLocation::builder()
        .name(class_name)
        .kind("type")
        .build();
    Location::builder().logical_locations(vec![logical]).build()
}

fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::opcodes;

    #[test]
    fn sarif_is_minimal_and_valid_shape() {
        let invocation = build_invocation(Vec::new(), true);
        let sarif = build_sarif(Vec::new(), Vec::new(), invocation);
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");

        assert_eq!(value["version"], "2.1.0");
        assert_eq!(value["$schema"], SCHEMA_URL);
        assert_eq!(value["runs"][0]["tool"]["driver"]["name"], TOOL_NAME);
        assert_eq!(
            value["runs"][0]["tool"]["driver"]["informationUri"],
            INFORMATION_URI
        );
        assert!(
            value["runs"][0]["results"]
                .as_array()
                .expect("results array")
                .is_empty()
        );
        assert_eq!(value["runs"][0]["invocations"][0]["executionSuccessful"], true);
    }

    #[test]
    fn edits_and_analysis_failures_become_results() {
        let program = Program::default();
        let class = ClassSpec::new("demo/Broken")
            .method(MethodSpec::new("pop", "()V").op(opcodes::POP).op(opcodes::RETURN))
            .load(&program);
        let pop = program.method_by_name(class, "pop").expect("pop");
        assert!(cfg::rebuild_cfg(&program, pop).is_some());

        let edits = vec![Edit {
            pass: "field-renamer",
            target: EditTarget::Field {
                owner: "demo/Broken".to_string(),
                name: "x".to_string(),
            },
            message: "renamed to field1".to_string(),
        }];
        let mut results = edit_results(&edits);
        results.extend(cfg_results(&program));
        let sarif = build_sarif(Vec::new(), results, build_invocation(Vec::new(), true));
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");

        let results = value["runs"][0]["results"].as_array().expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["ruleId"], "field-renamer");
        assert_eq!(
            results[0]["locations"][0]["logicalLocations"][0]["name"],
            "demo/Broken.x"
        );
        assert_eq!(results[1]["ruleId"], CFG_ANALYSIS);
        assert_eq!(
            results[1]["locations"][0]["logicalLocations"][0]["name"],
            "demo/Broken.pop()V"
        );
        let rules = value["runs"][0]["tool"]["driver"]["rules"]
            .as_array()
            .expect("rules");
        assert_eq!(rules.len(), 2);
    }
}
