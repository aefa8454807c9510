//! Stage result schemas and their serde shapes must accept the same payloads.

use pipeline::agents::{fixer, implementer, planner, simple, verifier};
use pipeline::core::types::{
    FixerResult, ImplementerResult, PlanResult, SimpleResult, StageName, VerifierResult,
};
use pipeline::io::gateway::validate_payload;
use pipeline::test_support::{
    bug, change, fixer_payload, implementer_payload, plan_payload, simple_payload, verifier_fail,
    verifier_pass,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

fn schema(raw: &str) -> Value {
    serde_json::from_str(raw).expect("schema parses")
}

fn accepts<T: DeserializeOwned>(stage: StageName, raw_schema: &str, payload: Value) -> T {
    validate_payload(stage, &payload, &schema(raw_schema)).expect("schema accepts payload");
    serde_json::from_value(payload).expect("type accepts payload")
}

#[test]
fn builder_payloads_match_schemas_and_types() {
    let plan: PlanResult = accepts(
        StageName::Planner,
        planner::RESULT_SCHEMA,
        plan_payload(&["src/a.rs", "src/b.rs"]),
    );
    assert_eq!(plan.plan.len(), 2);

    let implemented: ImplementerResult = accepts(
        StageName::Implementer,
        implementer::RESULT_SCHEMA,
        implementer_payload(vec![change("src/a.rs", "created", "new")]),
    );
    assert_eq!(implemented.changes.len(), 1);

    let verdict: VerifierResult = accepts(
        StageName::Verifier,
        verifier::RESULT_SCHEMA,
        verifier_fail(vec![bug("src/a.rs", 1, "low", "nit")]),
    );
    assert!(!verdict.passed);

    let fixed: FixerResult = accepts(
        StageName::Fixer,
        fixer::RESULT_SCHEMA,
        fixer_payload(
            vec![json!({ "file": "src/a.rs", "bug": "nit", "fix": "tidy" })],
            vec![change("src/a.rs", "modified", "tidy")],
        ),
    );
    assert_eq!(fixed.fixed.len(), 1);

    let single: SimpleResult = accepts(
        StageName::Simple,
        simple::RESULT_SCHEMA,
        simple_payload(vec![change("README.md", "modified", "typo")], verifier_pass()),
    );
    assert!(single.verification.passed);
}

#[test]
fn schemas_reject_unknown_fields() {
    let mut payload = implementer_payload(Vec::new());
    payload["extra"] = json!(true);
    assert!(
        validate_payload(
            StageName::Implementer,
            &payload,
            &schema(implementer::RESULT_SCHEMA)
        )
        .is_err()
    );
}

#[test]
fn schemas_reject_unknown_enum_values() {
    let payload = verifier_fail(vec![bug("src/a.rs", 1, "blocker", "x")]);
    assert!(
        validate_payload(StageName::Verifier, &payload, &schema(verifier::RESULT_SCHEMA)).is_err()
    );
    let payload = implementer_payload(vec![change("src/a.rs", "renamed", "x")]);
    assert!(
        validate_payload(
            StageName::Implementer,
            &payload,
            &schema(implementer::RESULT_SCHEMA)
        )
        .is_err()
    );
}
