//! Prompt construction, persistence and dataset splitting through the
//! public API.

use promptopt::evaluation::Evaluator;
use promptopt::prelude::*;
use promptopt::prompt::store::{FEW_SHOT_FILE, SYSTEM_PROMPT_FILE, USER_PROMPT_FILE};
use serde_json::json;
use std::sync::Arc;

fn demos() -> Vec<FewShotExample> {
    vec![
        FewShotExample::new("great movie", "positive"),
        FewShotExample::new("dull plot", "negative"),
    ]
}

#[test]
fn system_prompt_without_user_prompt_is_rejected() {
    let err = PromptBuilder::new()
        .set_system_prompt("You classify reviews.", Vec::<String>::new())
        .adapt()
        .unwrap_err();
    assert!(matches!(err, FormatError::SystemWithoutUser));
}

#[test]
fn user_prompt_alone_gets_an_empty_system_prompt() {
    let doc = PromptBuilder::new()
        .set_user_prompt("Review: {{review}}", ["review"])
        .adapt()
        .unwrap();
    assert_eq!(doc.fetch_system_template(), "");
    assert!(doc.system_variables().is_empty());
}

#[test]
fn converse_prompt_round_trips() {
    let doc = PromptBuilder::new()
        .set_system_prompt("Label the {{domain}} review.", ["domain"])
        .set_user_prompt("Review: {{review}}", ["review"])
        .add_few_shot(demos(), FewShotFormat::Converse)
        .adapt()
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    doc.save(dir.path()).unwrap();
    assert!(dir.path().join(SYSTEM_PROMPT_FILE).exists());
    assert!(dir.path().join(USER_PROMPT_FILE).exists());

    let few_shot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(FEW_SHOT_FILE)).unwrap())
            .unwrap();
    assert_eq!(few_shot[0]["role"], "user");
    assert_eq!(few_shot[0]["content"][0]["text"], "great movie");
    assert_eq!(few_shot[1]["role"], "assistant");
    assert_eq!(few_shot.as_array().unwrap().len(), 4);

    let loaded = PromptDocument::load(dir.path()).unwrap();
    assert_eq!(loaded.fetch_system_template(), doc.fetch_system_template());
    assert_eq!(loaded.fetch_user_template(), doc.fetch_user_template());
    assert_eq!(loaded.few_shot_examples(), doc.few_shot_examples());
}

#[test]
fn inline_formats_write_no_few_shot_file() {
    for format in [FewShotFormat::AppendToUser, FewShotFormat::AppendToSystem] {
        let doc = PromptBuilder::new()
            .set_system_prompt("Label it.", Vec::<String>::new())
            .set_user_prompt("Review: {{review}}", ["review"])
            .add_few_shot(demos(), format)
            .adapt()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        doc.save(dir.path()).unwrap();
        assert!(!dir.path().join(FEW_SHOT_FILE).exists());

        let inlined = match format {
            FewShotFormat::AppendToUser => USER_PROMPT_FILE,
            _ => SYSTEM_PROMPT_FILE,
        };
        let text = std::fs::read_to_string(dir.path().join(inlined)).unwrap();
        assert!(text.contains("Input: great movie"), "{text}");

        let loaded = PromptDocument::load(dir.path()).unwrap();
        assert_eq!(loaded, doc);
    }
}

#[test]
fn empty_system_prompt_is_not_written() {
    let doc = PromptBuilder::new()
        .set_user_prompt("{{q}}", ["q"])
        .adapt()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    doc.save(dir.path()).unwrap();
    assert!(!dir.path().join(SYSTEM_PROMPT_FILE).exists());
    assert_eq!(PromptDocument::load(dir.path()).unwrap(), doc);
}

#[test]
fn malformed_few_shot_json_is_a_format_error() {
    let err = PromptBuilder::new()
        .set_user_prompt("{{q}}", ["q"])
        .add_few_shot_json(&json!([{"question": "x"}]), FewShotFormat::Converse)
        .unwrap_err();
    assert!(matches!(err, FormatError::InvalidFewShot(_)));
}

fn reviews(n: usize) -> Dataset {
    let rows = (0..n).map(|i| json!({"review": format!("r{i}"), "label": "pos"}));
    Dataset::from_rows(rows, &["review"], &["label"]).unwrap()
}

#[test]
fn half_split_of_four_is_two_and_two() {
    let (train, test) = reviews(4).split(0.5).unwrap();
    assert_eq!((train.len(), test.len()), (2, 2));
    assert_eq!(train.get(0).unwrap().inputs["review"], "r0");
    assert_eq!(test.get(0).unwrap().inputs["review"], "r2");
}

#[test]
fn half_split_of_one_is_an_error() {
    assert!(matches!(
        reviews(1).split(0.5),
        Err(FormatError::EmptyTrainSplit { total: 1, .. })
    ));
}

#[tokio::test]
async fn evaluator_scores_a_prompt_over_a_dataset() {
    let backend = FnBackend::new(|_: &ModelRequest| Ok("pos".to_string()));
    let inference = InferenceAdapter::new(backend, InferenceConfig::default().with_rate_limit(0));
    let prompt = PromptBuilder::new()
        .set_user_prompt("{{review}}", ["review"])
        .adapt()
        .unwrap();
    let evaluator = Evaluator::new(prompt, reviews(3), Arc::new(ExactMatch), &inference);
    assert_eq!(evaluator.aggregate_score("m").await, 1.0);
    assert_eq!(evaluator.scores("m").await.len(), 3);
}
