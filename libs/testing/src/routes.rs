//! HTTP handlers for the mock resource manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use tracing::debug;

use crate::state::{
    ComponentDoc, InjectedResponse, MockComponent, MockOperation, MockState, RecordedRequest,
    ServiceDoc,
};
use crate::MockAuth;

#[derive(Clone)]
pub(crate) struct Shared {
    pub state: Arc<Mutex<MockState>>,
    pub auth: MockAuth,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Params = Query<HashMap<String, String>>;

pub(crate) fn router(shared: Shared) -> Router {
    Router::new()
        .route("/app/v1/services", post(create_service))
        .route(
            "/app/v1/services/{name}",
            get(get_service).delete(delete_service),
        )
        .route(
            "/app/v1/services/{name}/components/{component}",
            put(flex_component),
        )
        .with_state(shared)
}

fn diagnostics(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "diagnostics": message.into() }))).into_response()
}

fn injected(response: InjectedResponse) -> Response {
    match response {
        InjectedResponse::Status(code) => diagnostics(
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "injected failure",
        ),
        InjectedResponse::Garbage => (StatusCode::OK, "<html>not json</html>").into_response(),
    }
}

/// Records the request, enforces auth and applies failure injection.
fn admit(
    shared: &Shared,
    state: &mut MockState,
    method: Method,
    path: String,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    op: MockOperation,
) -> Result<(), Response> {
    let user = params.get("user.name").cloned();
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    debug!(%method, %path, ?user, "Mock resource manager request");
    let recorded = RecordedRequest {
        method: method.to_string(),
        path,
        user: user.clone(),
        authorization: authorization.clone(),
    };
    let is_mutation = recorded.is_mutation();
    state.requests.push(recorded);

    let authorized = match &shared.auth {
        MockAuth::None => true,
        MockAuth::Simple { user: expected } => user.as_deref() == Some(expected.as_str()),
        MockAuth::Negotiate { token } => {
            authorization.as_deref() == Some(format!("Negotiate {token}").as_str())
        }
    };
    if !authorized {
        return Err(diagnostics(StatusCode::UNAUTHORIZED, "authentication required"));
    }

    if let Some(response) = state.take_injected(op) {
        return Err(injected(response));
    }

    if is_mutation {
        state.note_mutation();
    } else {
        state.settle();
    }
    Ok(())
}

async fn create_service(
    State(shared): State<Shared>,
    Query(params): Params,
    headers: HeaderMap,
    Json(doc): Json<ServiceDoc>,
) -> Response {
    let mut state = shared.lock();
    if let Err(response) = admit(
        &shared,
        &mut state,
        Method::POST,
        "/services".to_string(),
        &params,
        &headers,
        MockOperation::CreateService,
    ) {
        return response;
    }

    if !state.create_service(&doc) {
        return diagnostics(
            StatusCode::CONFLICT,
            format!("Service {} already exists", doc.name),
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "uri": format!("/app/v1/services/{}", doc.name),
            "diagnostics": "Application ID: application_1700000000000_0001",
        })),
    )
        .into_response()
}

async fn get_service(
    State(shared): State<Shared>,
    Path(name): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Response {
    let mut state = shared.lock();
    if let Err(response) = admit(
        &shared,
        &mut state,
        Method::GET,
        format!("/services/{name}"),
        &params,
        &headers,
        MockOperation::GetService,
    ) {
        return response;
    }

    match state.render_service(&name) {
        Some(doc) => (StatusCode::OK, Json(doc)).into_response(),
        None => diagnostics(StatusCode::NOT_FOUND, format!("Service {name} not found")),
    }
}

async fn flex_component(
    State(shared): State<Shared>,
    Path((name, component)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
    Json(doc): Json<ComponentDoc>,
) -> Response {
    let mut state = shared.lock();
    if let Err(response) = admit(
        &shared,
        &mut state,
        Method::PUT,
        format!("/services/{name}/components/{component}"),
        &params,
        &headers,
        MockOperation::FlexComponent,
    ) {
        return response;
    }

    let Some(count) = doc.number_of_containers else {
        return diagnostics(StatusCode::BAD_REQUEST, "number_of_containers is required");
    };
    let Some(service) = state.services.get_mut(&name) else {
        return diagnostics(StatusCode::NOT_FOUND, format!("Service {name} not found"));
    };

    let now = std::time::Instant::now();
    match service.components.get_mut(&component) {
        Some(existing) => {
            existing.desired = count;
            existing.pending_since = Some(now);
        }
        None if doc.artifact.is_some() && doc.resource.is_some() => {
            let created = MockComponent {
                artifact: doc.artifact.clone(),
                resource: doc.resource.clone(),
                launch_command: doc.launch_command.clone(),
                desired: count,
                pending_since: Some(now),
                containers: Vec::new(),
            };
            service.components.insert(component.clone(), created);
        }
        None => {
            return diagnostics(
                StatusCode::NOT_FOUND,
                format!("Component {component} not found in service {name}"),
            );
        }
    }

    diagnostics(
        StatusCode::OK,
        format!("Updating component ({component}) size to {count}"),
    )
}

async fn delete_service(
    State(shared): State<Shared>,
    Path(name): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Response {
    let mut state = shared.lock();
    if let Err(response) = admit(
        &shared,
        &mut state,
        Method::DELETE,
        format!("/services/{name}"),
        &params,
        &headers,
        MockOperation::DeleteService,
    ) {
        return response;
    }

    match state.services.remove(&name) {
        Some(_) => diagnostics(StatusCode::OK, format!("Successfully destroyed service {name}")),
        None => diagnostics(StatusCode::NOT_FOUND, format!("Service {name} not found")),
    }
}
