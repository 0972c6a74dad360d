//! Prompt sent to the action decider on the live path

use std::fmt::Write as _;

use crate::action::ActionOutput;
use crate::test_case::TestCase;

/// Describe the test intent, its expectations and the current page.
pub fn compose(test: &TestCase, observation: &ActionOutput, base_url: &str) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "Test: \"{}\"", test.name);
    let _ = writeln!(prompt, "Application under test: {}", base_url);
    if let Some(payload) = &test.payload {
        let _ = writeln!(prompt, "Context: {}", payload);
    }

    if !test.expectations.is_empty() {
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "Expected outcomes:");
        for (i, expectation) in test.expectations.iter().enumerate() {
            let _ = write!(prompt, "{}. {}", i + 1, expectation.description);
            if let Some(payload) = &expectation.payload {
                let _ = write!(prompt, " (context: {})", payload);
            }
            let _ = writeln!(prompt);
        }
    }

    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Current page:");
    if let Some(url) = &observation.metadata.url {
        let _ = writeln!(prompt, "- URL: {}", url);
    }
    if let Some(title) = &observation.metadata.title {
        let _ = writeln!(prompt, "- Title: {}", title);
    }
    if observation.image.is_some() {
        let _ = writeln!(prompt, "- A screenshot of the page is attached.");
    }

    let _ = writeln!(prompt);
    prompt.push_str(
        "Carry out the test by interacting with the page one action at a time. \
         When every expected outcome has been verified, or one of them clearly \
         cannot be met, stop and report whether the test passed or failed with \
         a short reason.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionMetadata;
    use crate::test_case::Expectation;
    use serde_json::json;

    #[test]
    fn test_prompt_mentions_intent_and_state() {
        let test = TestCase::new("user can reset password", "auth.test.yaml")
            .with_payload(json!({ "email": "a@example.com" }))
            .with_expectation(Expectation::new("reset email confirmation is shown"))
            .with_expectation(
                Expectation::new("login form is visible").with_payload(json!("after redirect")),
            );
        let observation = ActionOutput {
            metadata: ActionMetadata {
                url: Some("http://localhost:3000/login".to_string()),
                title: Some("Sign in".to_string()),
                fingerprint: None,
            },
            ..Default::default()
        };

        let prompt = compose(&test, &observation, "http://localhost:3000");
        assert!(prompt.contains("Test: \"user can reset password\""));
        assert!(prompt.contains("a@example.com"));
        assert!(prompt.contains("1. reset email confirmation is shown"));
        assert!(prompt.contains("2. login form is visible (context: \"after redirect\")"));
        assert!(prompt.contains("- URL: http://localhost:3000/login"));
        assert!(prompt.contains("- Title: Sign in"));
        assert!(!prompt.contains("screenshot of the page"));
    }
}
