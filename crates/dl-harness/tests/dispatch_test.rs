//! Dispatch loop driving the built-in tools against a real directory.

use std::sync::Arc;

use dl_core::cancel::CancelSignal;
use dl_harness::builtin_tools::builtin_registry;
use dl_harness::dispatch::{DispatchError, DispatchLoop};
use dl_harness::provider::{Message, ProviderError, Response, Role, ScriptedProvider, ToolCall};
use dl_harness::tools::ToolContext;
use serde_json::json;

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args.to_string(),
    }
}

#[tokio::test]
async fn agent_edits_files_through_tools() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("README.md"), "# Project\n").unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(Response::tool_calls(vec![call("t1", "list_dir", json!({}))]).with_usage(200, 15)),
        Ok(Response::tool_calls(vec![
            call(
                "t2",
                "write_file",
                json!({"path": "docs/usage.md", "content": "Run it.\n"}),
            ),
            call("t3", "run_command", json!({"command": "cat docs/usage.md"})),
        ])
        .with_usage(300, 40)),
        Ok(Response::text("Added docs/usage.md").with_usage(350, 12)),
    ]));

    let dispatcher = DispatchLoop::new(provider.clone(), builtin_registry());
    let ctx = ToolContext::new(tmp.path(), CancelSignal::new());
    let report = dispatcher
        .run(
            vec![
                Message::system("You maintain this repository."),
                Message::user("Document usage."),
            ],
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(tmp.path().join("docs/usage.md")).unwrap(),
        "Run it.\n"
    );
    assert_eq!(report.turns, 3);
    assert_eq!(report.tool_calls, 3);
    assert_eq!(report.usage.input_tokens, 850);
    assert_eq!(report.usage.output_tokens, 67);
    assert_eq!(report.final_text(), Some("Added docs/usage.md"));

    let requests = provider.requests();
    let listing = requests[1]
        .iter()
        .find(|m| m.role == Role::Tool)
        .map(|m| m.content.clone())
        .unwrap();
    assert_eq!(listing, "README.md");

    let command_output = requests[2]
        .iter()
        .rev()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(command_output.content.contains("exit code: 0"));
    assert!(command_output.content.contains("Run it."));
}

#[tokio::test]
async fn failing_tools_do_not_stop_the_conversation() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(Response::tool_calls(vec![
            call("t1", "read_file", json!({"path": "missing.txt"})),
            call("t2", "read_file", json!({"path": "../../etc/passwd"})),
            call("t3", "write_file", json!({"path": "x.txt"})),
        ])),
        Ok(Response::text("gave up politely")),
    ]));

    let report = DispatchLoop::new(provider, builtin_registry())
        .run(
            vec![Message::user("go")],
            &ToolContext::new(tmp.path(), CancelSignal::new()),
        )
        .await
        .unwrap();

    let errors: Vec<_> = report
        .conversation
        .iter()
        .filter(|m| m.role == Role::Tool && m.is_error)
        .collect();
    assert_eq!(errors.len(), 3);
    assert!(errors[1].content.contains("escapes"));
    assert!(errors[2].content.contains("content"));
}

#[tokio::test]
async fn failure_keeps_conversation_for_diagnostics() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::InvalidRequest(
        "model not found".into(),
    ))]));
    let failure = DispatchLoop::new(provider, builtin_registry())
        .run(
            vec![Message::user("go")],
            &ToolContext::new(tmp.path(), CancelSignal::new()),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        DispatchError::Provider(ProviderError::InvalidRequest(_))
    ));
    assert_eq!(failure.conversation.len(), 1);
    assert_eq!(failure.usage.invocations, 1);
}
