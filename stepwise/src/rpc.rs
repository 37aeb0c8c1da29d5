//! JSON-lines engine surface over stdio (`stepwise serve`).
//!
//! Each input line is `{"id", "method", "params"}`; each output line is
//! `{"id", "result"}` or `{"id", "error": {"kind", "message", "details"}}`.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::engine::{FinishRequest, StartRequest, WorkflowEngine};
use crate::error::EngineError;
use crate::io::judge::Judge;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct AbortParams {
    session_id: String,
    #[serde(default = "default_abort_reason")]
    reason: String,
}

fn default_abort_reason() -> String {
    "aborted by caller".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub kind: &'static str,
    pub message: String,
    pub details: Value,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: "invalid_request",
            message: message.into(),
            details: Value::Null,
        }
    }
}

impl From<EngineError> for RpcError {
    fn from(err: EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RpcResponse {
    Ok { id: Value, result: Value },
    Err { id: Value, error: RpcError },
}

/// Answer one request line. Never fails; problems become error responses.
pub async fn handle_line<J: Judge>(engine: &WorkflowEngine<J>, line: &str) -> Value {
    let request = match serde_json::from_str::<RpcRequest>(line) {
        Ok(request) => request,
        Err(err) => {
            let error = RpcError::invalid_request(format!("malformed request: {err}"));
            return encode(RpcResponse::Err {
                id: Value::Null,
                error,
            });
        }
    };
    let id = request.id.clone();
    match dispatch(engine, request).await {
        Ok(result) => encode(RpcResponse::Ok { id, result }),
        Err(error) => encode(RpcResponse::Err { id, error }),
    }
}

async fn dispatch<J: Judge>(
    engine: &WorkflowEngine<J>,
    request: RpcRequest,
) -> Result<Value, RpcError> {
    debug!(method = %request.method, "rpc request");
    match request.method.as_str() {
        "get_workflows" => to_result(engine.list_workflows().await?),
        "start_workflow" => {
            let params: StartRequest = params(request.params)?;
            to_result(engine.start(params).await?)
        }
        "finished_step" => {
            let params: FinishRequest = params(request.params)?;
            to_result(engine.finished_step(params).await?)
        }
        "abort_workflow" => {
            let params: AbortParams = params(request.params)?;
            to_result(engine.abort(&params.session_id, &params.reason).await?)
        }
        "get_stack" => to_result(engine.stack().await?),
        other => Err(RpcError::invalid_request(format!("unknown method '{other}'"))),
    }
}

fn params<T: DeserializeOwned>(raw: Value) -> Result<T, RpcError> {
    let raw = if raw.is_null() {
        Value::Object(Map::new())
    } else {
        raw
    };
    serde_json::from_value(raw).map_err(|err| RpcError::invalid_request(format!("invalid params: {err}")))
}

fn to_result(value: impl Serialize) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| EngineError::Internal(err.into()).into())
}

fn encode(response: RpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|err| {
        serde_json::json!({
            "id": null,
            "error": { "kind": "internal", "message": err.to_string(), "details": null }
        })
    })
}

/// Serve requests from `reader` until end of input, one response per line.
#[instrument(skip_all)]
pub async fn serve<J, R, W>(engine: &WorkflowEngine<J>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    J: Judge,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(engine, &line).await;
        let mut buf = serde_json::to_string(&response).context("encode response")?;
        buf.push('\n');
        writer.write_all(buf.as_bytes()).await.context("write response")?;
        writer.flush().await.context("flush response")?;
    }
    debug!("rpc input closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::job::StepEntry;
    use crate::test_support::{ScriptedJudge, TestProject, job, single_output, step, workflow};

    fn project() -> TestProject {
        let project = TestProject::new();
        project.add_job(&job(
            vec![single_output(step("draft"), "report")],
            vec![workflow("main", vec![StepEntry::Single("draft".to_string())])],
        ));
        project
    }

    #[tokio::test]
    async fn serves_one_response_per_line() {
        let project = project();
        let engine = project.engine(ScriptedJudge::passing());
        let input = concat!(
            r#"{"id":1,"method":"get_workflows"}"#,
            "\n\n",
            r#"{"id":2,"method":"start_workflow","params":{"job":"job","goal":"ship"}}"#,
            "\n",
            r#"{"id":3,"method":"get_stack"}"#,
            "\n",
        );
        let mut out = Vec::new();
        serve(&engine, input.as_bytes(), &mut out).await.expect("serve");

        let responses: Vec<Value> = String::from_utf8(out)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["jobs"][0]["name"], "job");
        assert_eq!(responses[1]["result"]["workflow_auto_selected"], true);
        assert_eq!(responses[2]["result"].as_array().expect("stack").len(), 1);
    }

    #[tokio::test]
    async fn engine_errors_carry_stable_kind() {
        let project = project();
        let engine = project.engine(ScriptedJudge::passing());
        let response = handle_line(
            &engine,
            &json!({ "id": "a", "method": "start_workflow", "params": { "job": "ghost" } }).to_string(),
        )
        .await;
        assert_eq!(response["id"], "a");
        assert_eq!(response["error"]["kind"], "job_not_found");

        let response = handle_line(
            &engine,
            &json!({ "id": 7, "method": "abort_workflow", "params": { "session_id": "nope" } }).to_string(),
        )
        .await;
        assert_eq!(response["error"]["kind"], "session_not_found");
    }

    #[tokio::test]
    async fn bad_requests_are_invalid_request() {
        let project = project();
        let engine = project.engine(ScriptedJudge::passing());
        for line in [
            "not json".to_string(),
            json!({ "id": 1, "method": "launch_rockets" }).to_string(),
            json!({ "id": 2, "method": "finished_step", "params": { "outputs": 5 } }).to_string(),
        ] {
            let response = handle_line(&engine, &line).await;
            assert_eq!(response["error"]["kind"], "invalid_request", "{line}");
            assert!(response.get("result").is_none());
        }
    }

    #[tokio::test]
    async fn finished_step_round_trip() {
        let project = project();
        project.write_file("out/report.md", "# Report\n");
        let engine = project.engine(ScriptedJudge::passing());
        let started = handle_line(
            &engine,
            &json!({ "id": 1, "method": "start_workflow", "params": { "job": "job", "goal": "g" } }).to_string(),
        )
        .await;
        let session_id = started["result"]["session_id"].as_str().expect("session id");

        let finished = handle_line(
            &engine,
            &json!({
                "id": 2,
                "method": "finished_step",
                "params": { "session_id": session_id, "outputs": { "report": "out/report.md" } }
            })
            .to_string(),
        )
        .await;
        assert_eq!(finished["result"]["status"], "workflow_complete");
    }
}
