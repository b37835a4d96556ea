use super::{StepHandler, StepHandlerOutput};
use crate::definition::{ApiCallConfig, ResolvedStep, StepPayload};
use crate::orchestration::error::StepError;
use crate::orchestration::state::FlowRuntimeState;
use crate::orchestration::template::render_against;
use crate::shared::{HttpClient, HttpRequest};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub struct ApiCallHandler {
    http: Arc<dyn HttpClient>,
}

impl ApiCallHandler {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }
}

fn render(field: &str, template: &str, context: &Value) -> Result<String, StepError> {
    render_against(template, context)
        .map_err(|reason| StepError::permanent(format!("api call {field}: {reason}")))
}

fn build_request(
    config: &ApiCallConfig,
    input: &Map<String, Value>,
) -> Result<HttpRequest, StepError> {
    let context = Value::Object(input.clone());
    let mut url = render("apiUrl", &config.api_url, &context)?;
    if !config.query_parameters.is_empty() {
        let mut pairs = Vec::with_capacity(config.query_parameters.len());
        for (name, template) in &config.query_parameters {
            let value = render(&format!("query parameter `{name}`"), template, &context)?;
            pairs.push(format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(&value)
            ));
        }
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&pairs.join("&"));
    }

    let mut headers = BTreeMap::new();
    for (name, template) in &config.api_headers {
        headers.insert(
            name.clone(),
            render(&format!("header `{name}`"), template, &context)?,
        );
    }

    let body = config
        .api_http_method
        .carries_body()
        .then(|| input.get("body").cloned().unwrap_or_else(|| context.clone()));

    Ok(HttpRequest {
        method: config.api_http_method,
        url,
        headers,
        body,
        timeout: config.timeout_ms.map(Duration::from_millis),
    })
}

impl StepHandler for ApiCallHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let StepPayload::ApiCall(config) = &step.payload else {
            return Err(StepError::permanent("api call handler needs an API_CALL step"));
        };
        let request = build_request(config, input)?;
        tracing::info!(
            step_instance_id = %step.step_instance_id,
            method = %request.method,
            url = %request.url,
            "calling external api"
        );

        let response = self
            .http
            .send(&request)
            .map_err(|err| StepError::transient(err.to_string()))?;
        let body = response
            .json()
            .unwrap_or_else(|| Value::String(response.body.clone()));

        match response.status {
            200..=299 => Ok(StepHandlerOutput::data(json!({
                "statusCode": response.status,
                "body": body,
            }))),
            408 | 429 | 500..=599 => Err(StepError::transient(format!(
                "{} {} returned http {}",
                request.method, request.url, response.status
            ))
            .with_details(json!({"statusCode": response.status, "body": body}))),
            status => Err(StepError::permanent(format!(
                "{} {} returned http {status}",
                request.method, request.url
            ))
            .with_details(json!({"statusCode": status, "body": body}))),
        }
    }
}
