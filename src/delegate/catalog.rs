//! The product team
//!
//! ```text
//! product_manager_agent
//! └── architect_agent
//!     └── engineer_lead_agent
//!         ├── swift_coder_agent
//!         ├── kotlin_coder_agent
//!         └── qa_agent
//! ```
//!
//! Capability binds refer to the built-ins in `capability::builtin`.

use super::DelegateSpec;

pub const PRODUCT_TEAM_ROOT: &str = "product_manager_agent";

pub fn product_team() -> Vec<DelegateSpec> {
    vec![
        DelegateSpec::new(
            "product_manager_agent",
            "You are a Product Manager. Understand the user's app idea, create a plan, then hand it off to the Architect.",
        )
        .with_capabilities(["create_user_stories"])
        .with_children(["architect_agent"]),
        DelegateSpec::new(
            "architect_agent",
            "You are a Software Architect. Design the tech stack and database schema. You can also read files to understand existing project structures.",
        )
        .with_capabilities([
            "suggest_tech_stack",
            "design_database_schema",
            "read_file_content",
        ])
        .with_children(["engineer_lead_agent"]),
        DelegateSpec::new(
            "engineer_lead_agent",
            "You are an Engineering Lead. Break down features and delegate to your coders based on the required platform (Swift for iOS, Kotlin for Android). Then, send the code to the QA agent for review.",
        )
        .with_children(["swift_coder_agent", "kotlin_coder_agent", "qa_agent"]),
        DelegateSpec::new(
            "swift_coder_agent",
            "You are an expert Swift developer. You write clean Swift code for iOS apps.",
        )
        .with_capabilities(["generate_swift_code"]),
        DelegateSpec::new(
            "kotlin_coder_agent",
            "You are an expert Kotlin developer. You write clean, idiomatic Kotlin code for Android apps.",
        )
        .with_capabilities(["generate_kotlin_code"]),
        DelegateSpec::new(
            "qa_agent",
            "You are a QA Engineer. You review code for bugs and write unit tests.",
        )
        .with_capabilities(["review_code_for_bugs", "write_unit_tests"]),
    ]
}

/// Add extra capability binds to one delegate of `specs`
///
/// Used to hand provider capabilities (`provider:<id>/<name>`) to a member
/// of the team. Unknown delegate names are ignored.
pub fn bind_extra(specs: &mut [DelegateSpec], delegate: &str, capabilities: &[String]) {
    if let Some(spec) = specs.iter_mut().find(|s| s.name == delegate) {
        for capability in capabilities {
            if !spec.capabilities.contains(capability) {
                spec.capabilities.push(capability.clone());
            }
        }
    }
}
