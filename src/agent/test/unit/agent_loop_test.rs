//! Agent loop tests against a scripted provider.
//!
//! Every test drives `Agent::run` with canned OpenAI-style SSE lines and a
//! recording tool catalog, so no network or host is involved unless a test
//! sets one up explicitly.

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::testing::{
    RecordingCatalog, Reply, ScriptedTransport, Step, call_args, call_open, done, sse, text_chunk,
};
use super::*;
use crate::dispatch::dispatch_channel;
use crate::tools::{HostTool, HostToolCatalog, ToolPackage};

fn openai_agent(
    config: AgentConfig,
    transport: &Arc<ScriptedTransport>,
    catalog: Arc<dyn ToolCatalog>,
) -> Agent {
    let spec = ProviderRegistry::builtin().get(ProviderKind::OpenAi).unwrap();
    let provider_config = spec.default_config();
    Agent::new(config, spec, provider_config, catalog, transport.clone())
}

fn recording(catalog: RecordingCatalog) -> Arc<RecordingCatalog> {
    Arc::new(catalog)
}

fn event_log(agent: Agent) -> (Agent, Arc<Mutex<Vec<AgentEvent>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let agent = agent.with_events(Arc::new(move |event: AgentEvent| sink.lock().unwrap().push(event)));
    (agent, log)
}

#[tokio::test]
async fn test_single_tool_call_then_answer() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_lines(vec![
            call_open(0, "call_1", "get_selected_objects_names"),
            call_args(0, "{}"),
            done(),
        ])
        .push_lines(vec![
            text_chunk("The selected object is "),
            text_chunk("Cube."),
            done(),
        ]);
    let catalog = recording(RecordingCatalog::new().with_tool(
        "get_selected_objects_names",
        vec![ToolContent::text(r#"{"names":["Cube"]}"#)],
    ));

    let mut agent = openai_agent(AgentConfig::default(), &transport, catalog.clone());
    let answer = agent.run("What is selected?").await.unwrap();

    assert_eq!(answer, "The selected object is Cube.");
    assert_eq!(catalog.calls(), vec![("get_selected_objects_names".to_string(), json!({}))]);

    let history = agent.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].tool_calls.as_ref().unwrap()[0].id, "call_1");
    assert_eq!(history[2].role, Role::Tool);
    assert_eq!(history[2].content, r#"{"names":["Cube"]}"#);
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(history[3].content, "The selected object is Cube.");

    // The second round carries the tool result back to the model
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    let body = requests[1].body.as_ref().unwrap();
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][3]["role"], "tool");
    assert_eq!(body["tools"][0]["function"]["name"], "get_selected_objects_names");
}

#[tokio::test]
async fn test_fragmented_arguments_execute_once_when_complete() {
    let transport = Arc::new(ScriptedTransport::new());
    let catalog = recording(
        RecordingCatalog::new().with_tool("get_object_info", vec![ToolContent::text("{}")]),
    );

    let after_first = Arc::new(AtomicUsize::new(usize::MAX));
    let after_last = Arc::new(AtomicUsize::new(usize::MAX));
    let (c1, o1) = (catalog.clone(), after_first.clone());
    let (c2, o2) = (catalog.clone(), after_last.clone());

    transport.push(Reply::Lines(vec![
        Step::Line(call_open(0, "call_1", "get_object_info")),
        Step::Line(call_args(0, r#"{"object_"#)),
        Step::Call(Box::new(move || o1.store(c1.calls().len(), Ordering::SeqCst))),
        Step::Line(call_args(0, r#"name":"Cu"#)),
        Step::Line(call_args(0, r#"be"}"#)),
        // Still mid-stream: the call must already have run
        Step::Call(Box::new(move || o2.store(c2.calls().len(), Ordering::SeqCst))),
        Step::Line(text_chunk("Done")),
        Step::Line(done()),
    ]));

    let mut agent = openai_agent(AgentConfig::default(), &transport, catalog.clone());
    agent.run("Inspect the cube").await.unwrap();

    assert_eq!(after_first.load(Ordering::SeqCst), 0);
    assert_eq!(after_last.load(Ordering::SeqCst), 1);
    assert_eq!(
        catalog.calls(),
        vec![("get_object_info".to_string(), json!({"object_name": "Cube"}))]
    );
    let request = agent.history()[1].tool_calls.as_ref().unwrap()[0].clone();
    assert_eq!(request.arguments, r#"{"object_name":"Cube"}"#);
}

#[tokio::test]
async fn test_interleaved_calls_run_in_ready_order() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![
        call_open(0, "a", "first"),
        call_open(1, "b", "second"),
        call_args(0, r#"{"n":"#),
        call_args(1, r#"{"n":2}"#),
        call_args(0, "1}"),
        done(),
    ]);
    let catalog = recording(
        RecordingCatalog::new()
            .with_tool("first", vec![ToolContent::text("1")])
            .with_tool("second", vec![ToolContent::text("2")]),
    );

    let mut agent = openai_agent(AgentConfig::default(), &transport, catalog.clone());
    agent.run("go").await.unwrap();

    assert_eq!(
        catalog.calls(),
        vec![
            ("second".to_string(), json!({"n": 2})),
            ("first".to_string(), json!({"n": 1})),
        ]
    );
}

#[tokio::test]
async fn test_unfinished_call_forced_with_empty_object() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![call_open(3, "call_3", "get_scene_info"), done()]);
    let catalog = recording(
        RecordingCatalog::new().with_tool("get_scene_info", vec![ToolContent::text("{}")]),
    );

    let mut agent = openai_agent(AgentConfig::default(), &transport, catalog.clone());
    agent.run("Describe the scene").await.unwrap();

    assert_eq!(catalog.calls(), vec![("get_scene_info".to_string(), json!({}))]);
    // Tool round, then the empty closing round
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn test_literal_arguments_accepted_at_execution() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![
        call_open(0, "call_1", "select_objects"),
        call_args(0, "{'names': ['Cube', 'Light'], 'extend': True}"),
        done(),
    ]);
    let catalog = recording(
        RecordingCatalog::new().with_tool("select_objects", vec![ToolContent::text("ok")]),
    );

    let mut agent = openai_agent(AgentConfig::default(), &transport, catalog.clone());
    agent.run("Select them").await.unwrap();

    assert_eq!(
        catalog.calls(),
        vec![(
            "select_objects".to_string(),
            json!({"names": ["Cube", "Light"], "extend": true})
        )]
    );
}

#[tokio::test]
async fn test_unparseable_arguments_become_error_result() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![
        call_open(0, "call_1", "get_object_info"),
        call_args(0, r#"{"object_name": "#),
        done(),
    ]);
    let catalog = recording(
        RecordingCatalog::new().with_tool("get_object_info", vec![ToolContent::text("{}")]),
    );

    let mut agent = openai_agent(AgentConfig::default(), &transport, catalog.clone());
    agent.run("Inspect").await.unwrap();

    assert!(catalog.calls().is_empty());
    let result = &agent.history()[2];
    assert_eq!(result.role, Role::Tool);
    assert!(result.content.starts_with("Error: invalid tool arguments"));
    // The round still counts as a tool round
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn test_host_error_reaches_history_as_error_text() {
    let (dispatcher, queue) = dispatch_channel::<Vec<String>>();
    let stop = Arc::new(AtomicBool::new(false));
    let host_stop = stop.clone();
    let host = thread::spawn(move || {
        let mut objects = vec!["Cube".to_string()];
        while !host_stop.load(Ordering::SeqCst) {
            queue.drain(&mut objects);
            thread::sleep(Duration::from_millis(2));
        }
    });

    let catalog = HostToolCatalog::new(dispatcher);
    catalog.register(ToolPackage::new("object", "Objects").with_tool(HostTool::new(
        "get_object_info",
        "Get object info",
        json!({"type": "object"}),
        |objects: &mut Vec<String>, args| {
            let name = args["object_name"].as_str().unwrap_or_default().to_string();
            if !objects.contains(&name) {
                anyhow::bail!("not found");
            }
            Ok(json!({"name": name}))
        },
    )));

    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![
        call_open(0, "call_1", "get_object_info"),
        call_args(0, r#"{"object_name":"Sphere"}"#),
        done(),
    ]);

    let mut agent = openai_agent(AgentConfig::default(), &transport, Arc::new(catalog));
    agent.run("Where is the sphere?").await.unwrap();

    stop.store(true, Ordering::SeqCst);
    host.join().unwrap();

    assert_eq!(agent.history()[2].content, "Error: not found");
}

#[tokio::test]
async fn test_skip_mid_round_abandons_pending_call() {
    let transport = Arc::new(ScriptedTransport::new());
    let catalog = recording(
        RecordingCatalog::new().with_tool("delete_object", vec![ToolContent::text("ok")]),
    );
    let cancel = CancelFlags::new();
    let flags = cancel.clone();

    transport.push(Reply::Lines(vec![
        Step::Line(call_open(0, "call_1", "delete_object")),
        Step::Line(call_args(0, r#"{"object_name":"#)),
        Step::Call(Box::new(move || flags.request_skip())),
        Step::Line(call_args(0, r#""Cube"}"#)),
        Step::Line(done()),
    ]));
    transport.push_lines(vec![text_chunk("Next command answer"), done()]);

    let mut agent =
        openai_agent(AgentConfig::default(), &transport, catalog.clone()).with_cancel(cancel.clone());
    let answer = agent.run("Delete the cube").await.unwrap();

    assert_eq!(answer, "");
    assert!(catalog.calls().is_empty());
    assert_eq!(transport.requests().len(), 1);

    // The next command runs normally once the skip is cleared
    cancel.reset_skip();
    let answer = agent.run("Something else").await.unwrap();
    assert_eq!(answer, "Next command answer");
}

#[tokio::test]
async fn test_stop_before_forced_completion_executes_nothing() {
    let transport = Arc::new(ScriptedTransport::new());
    let catalog = recording(
        RecordingCatalog::new().with_tool("get_scene_info", vec![ToolContent::text("{}")]),
    );
    let cancel = CancelFlags::new();
    let flags = cancel.clone();

    transport.push(Reply::Lines(vec![
        Step::Line(call_open(3, "call_3", "get_scene_info")),
        Step::Call(Box::new(move || flags.request_stop())),
        Step::Line(done()),
    ]));

    let mut agent =
        openai_agent(AgentConfig::default(), &transport, catalog.clone()).with_cancel(cancel);
    agent.run("Describe").await.unwrap();

    assert!(catalog.calls().is_empty());
    assert_eq!(transport.requests().len(), 1);
}

/// Agent whose first `ToolCallStart` event requests a skip.
fn skip_on_first_call(agent: Agent, cancel: &CancelFlags) -> Agent {
    let flags = cancel.clone();
    agent.with_events(Arc::new(move |event: AgentEvent| {
        if matches!(event, AgentEvent::ToolCallStart { .. }) {
            flags.request_skip();
        }
    }))
}

#[tokio::test]
async fn test_skip_stops_remaining_calls_of_one_event() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![
        json!({"choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
            {"id": "call_1", "type": "function", "function": {"name": "create_object", "arguments": "{\"name\":\"A\"}"}},
            {"id": "call_2", "type": "function", "function": {"name": "create_object", "arguments": "{\"name\":\"B\"}"}}
        ]}}]})
        .to_string(),
    ]);
    let catalog = recording(
        RecordingCatalog::new().with_tool("create_object", vec![ToolContent::text("ok")]),
    );
    let cancel = CancelFlags::new();

    let config = AgentConfig {
        stream: false,
        ..AgentConfig::default()
    };
    let agent = openai_agent(config, &transport, catalog.clone()).with_cancel(cancel.clone());
    let mut agent = skip_on_first_call(agent, &cancel);
    agent.run("Create two objects").await.unwrap();

    assert_eq!(catalog.calls(), vec![("create_object".to_string(), json!({"name": "A"}))]);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_skip_stops_remaining_forced_calls() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![
        call_open(0, "call_1", "get_scene_info"),
        call_open(1, "call_2", "get_scene_info"),
        done(),
    ]);
    let catalog = recording(
        RecordingCatalog::new().with_tool("get_scene_info", vec![ToolContent::text("{}")]),
    );
    let cancel = CancelFlags::new();

    let agent =
        openai_agent(AgentConfig::default(), &transport, catalog.clone()).with_cancel(cancel.clone());
    let mut agent = skip_on_first_call(agent, &cancel);
    agent.run("Describe twice").await.unwrap();

    assert_eq!(catalog.calls().len(), 1);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_tools_unsupported_is_distinguished() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Reply::Status(
        400,
        r#"{"error": {"message": "deepseek-reasoner does not support Function Calling"}}"#.into(),
    ));

    let mut agent = openai_agent(AgentConfig::default(), &transport, recording(RecordingCatalog::new()));
    let err = agent.run("Make a cube").await.unwrap_err();

    let provider_err = err.downcast_ref::<ProviderError>().unwrap();
    assert!(provider_err.is_tools_unsupported());
}

#[tokio::test]
async fn test_http_failure_aborts_command() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Reply::Status(401, r#"{"error": {"message": "Incorrect API key"}}"#.into()));

    let mut agent = openai_agent(AgentConfig::default(), &transport, recording(RecordingCatalog::new()));
    let err = agent.run("hello").await.unwrap_err();
    assert!(err.to_string().contains("Incorrect API key"));
}

#[tokio::test]
async fn test_history_cleared_when_disabled() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_lines(vec![text_chunk("one"), done()])
        .push_lines(vec![text_chunk("two"), done()]);

    let config = AgentConfig {
        use_history: false,
        system_prompt: String::new(),
        ..AgentConfig::default()
    };
    let mut agent = openai_agent(config, &transport, recording(RecordingCatalog::new()));
    agent.run("first").await.unwrap();
    agent.run("second").await.unwrap();

    let requests = transport.requests();
    let messages = requests[1].body.as_ref().unwrap()["messages"].as_array().unwrap().clone();
    assert_eq!(messages, vec![json!({"role": "user", "content": "second"})]);
    assert_eq!(agent.history().len(), 2);
}

#[tokio::test]
async fn test_history_kept_across_commands() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_lines(vec![text_chunk("one"), done()])
        .push_lines(vec![text_chunk("two"), done()]);

    let mut agent = openai_agent(AgentConfig::default(), &transport, recording(RecordingCatalog::new()));
    agent.run("first").await.unwrap();
    agent.run("second").await.unwrap();

    // system + first + one + second
    let requests = transport.requests();
    assert_eq!(requests[1].body.as_ref().unwrap()["messages"].as_array().unwrap().len(), 4);

    agent.clear_history();
    assert!(agent.history().is_empty());
}

#[tokio::test]
async fn test_events_report_text_reasoning_and_tools() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_lines(vec![
            sse(json!({"choices": [{"delta": {"reasoning_content": "need names"}}]})),
            text_chunk("Checking"),
            call_open(0, "call_1", "get_selected_objects_names"),
            call_args(0, "{}"),
            done(),
        ])
        .push_lines(vec![text_chunk("Cube"), text_chunk("Cube"), done()]);
    let catalog = recording(RecordingCatalog::new().with_tool(
        "get_selected_objects_names",
        vec![ToolContent::text(r#"{"names":["Cube"]}"#)],
    ));

    let (mut agent, log) = event_log(openai_agent(AgentConfig::default(), &transport, catalog));
    let answer = agent.run("What is selected?").await.unwrap();
    // Duplicate chunks are kept
    assert_eq!(answer, "CubeCube");

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            AgentEvent::Reasoning("need names".into()),
            AgentEvent::Content("Checking".into()),
            AgentEvent::ToolCallStart {
                id: "call_1".into(),
                name: "get_selected_objects_names".into(),
                arguments: "{}".into(),
            },
            AgentEvent::ToolCallEnd {
                id: "call_1".into(),
                name: "get_selected_objects_names".into(),
                output: r#"{"names":["Cube"]}"#.into(),
            },
            AgentEvent::Content("Cube".into()),
            AgentEvent::Content("Cube".into()),
            AgentEvent::Done("CubeCube".into()),
        ]
    );

    // Text spoken before the call precedes it in history
    assert_eq!(agent.history()[1].content, "Checking");
    assert!(agent.history()[2].tool_calls.is_some());
}

#[tokio::test]
async fn test_non_streaming_response() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_lines(vec![
            json!({"choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "set_color", "arguments": "{\"r\":1}"}}
            ]}}]})
            .to_string(),
        ])
        .push_lines(vec![
            json!({"choices": [{"message": {"role": "assistant", "content": "Painted."}}]}).to_string(),
        ]);
    let catalog = recording(RecordingCatalog::new().with_tool("set_color", vec![ToolContent::text("ok")]));

    let config = AgentConfig {
        stream: false,
        ..AgentConfig::default()
    };
    let mut agent = openai_agent(config, &transport, catalog.clone());
    assert_eq!(agent.run("Paint it red").await.unwrap(), "Painted.");
    assert_eq!(catalog.calls(), vec![("set_color".to_string(), json!({"r": 1}))]);
    assert!(!transport.requests()[0].stream);
}

#[tokio::test]
async fn test_round_limit() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![call_open(0, "a", "loop"), call_args(0, "{}"), done()]);
    let catalog = recording(RecordingCatalog::new().with_tool("loop", vec![ToolContent::text("again")]));

    let config = AgentConfig {
        max_rounds: 1,
        ..AgentConfig::default()
    };
    let mut agent = openai_agent(config, &transport, catalog.clone());
    let err = agent.run("spin").await.unwrap_err();
    assert!(err.to_string().contains("Max rounds"));
    assert_eq!(catalog.calls().len(), 1);
}

#[tokio::test]
async fn test_image_and_resource_results_become_tool_messages() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_lines(vec![call_open(0, "call_1", "render"), call_args(0, "{}"), done()]);
    let catalog = recording(RecordingCatalog::new().with_tool(
        "render",
        vec![
            ToolContent::Image {
                data: "iVBORw0".into(),
                mime_type: "image/png".into(),
            },
            ToolContent::Resource(json!({"uri": "scene://Cube"})),
        ],
    ));

    let mut agent = openai_agent(AgentConfig::default(), &transport, catalog);
    agent.run("Render").await.unwrap();

    let history = agent.history();
    assert_eq!(history[2].images, vec!["data:image/png;base64,iVBORw0"]);
    assert_eq!(history[3].content, r#"{"uri":"scene://Cube"}"#);
    assert_eq!(history[3].tool_call_id.as_deref(), Some("call_1"));
}
