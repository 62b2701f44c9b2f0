//! The control-plane `/tickets/{id}` handlers. Reachable only from the control listener (a unix
//! socket or loopback TCP port, never the remote TLS listener), so these carry no independent
//! authorization of their own beyond "can you reach this socket".

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use crate::http::HttpError;
use crate::state::AppState;
use crate::ticket::TicketSpec;
use crate::ticket_store::TicketError;

pub async fn put_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(mut spec): Json<TicketSpec>,
) -> Result<Response, HttpError> {
    if spec.uuid != ticket_id {
        return Err(HttpError::bad_request("ticket body uuid does not match the path"));
    }
    spec.uuid = ticket_id;
    state.tickets.add(spec);
    Ok(StatusCode::OK.into_response())
}

pub async fn get_ticket(State(state): State<AppState>, Path(ticket_id): Path<String>) -> Result<Response, HttpError> {
    let status = state.tickets.get(&ticket_id).ok_or(TicketError::NotFound)?;
    Ok(Json(status).into_response())
}

pub async fn list_tickets(State(state): State<AppState>) -> Response {
    Json(state.tickets.list()).into_response()
}

#[derive(Deserialize)]
pub struct PatchTicketBody {
    timeout: u64,
}

pub async fn patch_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(body): Json<PatchTicketBody>,
) -> Result<Response, HttpError> {
    state.tickets.extend(&ticket_id, body.timeout)?;
    Ok(StatusCode::OK.into_response())
}

#[derive(Deserialize)]
pub struct DeleteTicketQuery {
    #[serde(default)]
    timeout: Option<u64>,
}

pub async fn delete_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<DeleteTicketQuery>,
) -> Result<Response, HttpError> {
    let timeout = Duration::from_secs(query.timeout.unwrap_or(0));
    state.tickets.cancel(&ticket_id, timeout).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
