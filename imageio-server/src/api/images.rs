//! The data-plane `/images/{id}` handlers: OPTIONS (capability probe), GET (download), PUT
//! (upload), PATCH (zero/flush), and `/images/{id}/extents`.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use futures::stream::TryStreamExt as _;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, ExtentContext};
use crate::extract::{ByteRange, parse_content_range_header, parse_range_header};
use crate::http::HttpError;
use crate::state::AppState;
use crate::ticket::Operation;
use crate::ticket_store::TicketError;

/// Every data-plane handler shares this mapping: a missing ticket is a capability failure here,
/// not a "resource doesn't exist" failure, so it renders as 403 rather than the 404 the
/// control-plane ticket CRUD handlers use for the same `TicketError::NotFound`.
fn data_plane(err: TicketError) -> HttpError {
    match err {
        TicketError::NotFound => HttpError::forbidden("no such ticket"),
        other => other.into(),
    }
}

#[derive(Serialize)]
struct OptionsBody {
    features: Vec<&'static str>,
    max_readers: Option<usize>,
    max_writers: Option<usize>,
}

/// Reports the server's generic capabilities, independent of any single ticket. Used by clients
/// probing a fresh connection on the control listener before they hold any ticket at all.
fn synthetic_capabilities_response() -> Response {
    let body = OptionsBody { features: vec!["extents", "zero", "flush"], max_readers: None, max_writers: None };
    (StatusCode::OK, [(header::ALLOW, "OPTIONS, GET, PUT, PATCH")], Json(body)).into_response()
}

pub async fn options_image(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> Result<Response, HttpError> {
    if ticket_id == "*" {
        return Ok(synthetic_capabilities_response());
    }

    let status = state.tickets.get(&ticket_id).ok_or(TicketError::NotFound).map_err(data_plane)?;
    let conf = state.conf_handle.get_conf();
    let backend = state.tickets.backend_for(&ticket_id, conf.nbd_concurrency, conf.tls_ca.as_deref()).await?;
    let backend_features = backend.features();

    let can_read = status.ops.contains(&Operation::Read);
    let can_write = status.ops.contains(&Operation::Write);

    let mut features = Vec::new();
    if backend_features.extents {
        features.push("extents");
    }
    if backend_features.dirty_extents && status.dirty {
        features.push("dirty");
    }
    if can_write && backend_features.zero {
        features.push("zero");
    }
    if can_write && backend_features.flush {
        features.push("flush");
    }

    let mut allow = vec!["OPTIONS"];
    if can_read {
        allow.push("GET");
    }
    if can_write {
        allow.extend(["PUT", "PATCH"]);
    }

    let body = OptionsBody {
        features,
        max_readers: can_read.then(|| backend.max_readers()),
        max_writers: can_write.then(|| backend.max_writers()),
    };

    Ok((StatusCode::OK, [(header::ALLOW, allow.join(", "))], Json(body)).into_response())
}

pub async fn get_image(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let status = state.tickets.get(&ticket_id).ok_or(TicketError::NotFound).map_err(data_plane)?;
    let range = parse_range_header(&headers, status.size)?.unwrap_or(ByteRange { start: 0, end: status.size });
    let is_partial = range.start != 0 || range.end != status.size;

    let lease = state.tickets.authorize(&ticket_id, Operation::Read, Some((range.start, range.end))).map_err(data_plane)?;
    let conf = state.conf_handle.get_conf();
    let backend = state.tickets.backend_for(&ticket_id, conf.nbd_concurrency, conf.tls_ca.as_deref()).await?;
    let chunk_size = state.buffer_pool.chunk_size() as u64;

    let body_stream = futures::stream::try_unfold((backend, lease, range.start), move |(backend, lease, cursor)| async move {
        if lease.is_canceled() {
            return Err(std::io::Error::other("ticket was canceled"));
        }
        if cursor >= range.end {
            return Ok(None);
        }
        let len = ((range.end - cursor).min(chunk_size)) as usize;
        let mut buf = vec![0u8; len];
        backend.read_to(cursor, &mut buf).await.map_err(std::io::Error::other)?;
        lease.record_bytes(len as u64);
        Ok(Some((Bytes::from(buf), (backend, lease, cursor + len as u64))))
    });

    let mut builder = Response::builder()
        .status(if is_partial { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK })
        .header(header::CONTENT_LENGTH, range.len())
        .header(header::ACCEPT_RANGES, "bytes");
    if is_partial {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {}-{}/*", range.start, range.end.saturating_sub(1)));
    }

    Ok(builder.body(Body::from_stream(body_stream)).expect("response builder invariants upheld"))
}

#[derive(Deserialize)]
pub struct FlushQuery {
    #[serde(default = "default_flush")]
    flush: String,
}

fn default_flush() -> String {
    "y".to_owned()
}

pub async fn put_image(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<FlushQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, HttpError> {
    let flush_at_end = query.flush != "n";

    let content_length: u64 = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| HttpError::bad_request("missing content-length"))?;

    let range = parse_content_range_header(&headers, content_length)?;
    let lease = state.tickets.authorize(&ticket_id, Operation::Write, Some((range.start, range.end))).map_err(data_plane)?;
    let conf = state.conf_handle.get_conf();
    let backend = state.tickets.backend_for(&ticket_id, conf.nbd_concurrency, conf.tls_ca.as_deref()).await?;

    let mut stream = body.into_data_stream();
    let mut cursor = range.start;

    while let Some(chunk) = stream
        .try_next()
        .await
        .map_err(|e| HttpError::bad_request(format!("error reading request body: {e}")))?
    {
        if lease.is_canceled() {
            return Err(HttpError::forbidden("ticket was canceled during transfer"));
        }
        let is_last = cursor + chunk.len() as u64 >= range.end;
        backend.write_from(cursor, &chunk, flush_at_end && is_last).await?;
        lease.record_bytes(chunk.len() as u64);
        cursor += chunk.len() as u64;
    }

    if cursor != range.end {
        return Err(HttpError::bad_request("request body shorter than declared content-range"));
    }

    Ok(StatusCode::OK.into_response())
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum PatchBody {
    Zero {
        #[serde(default)]
        offset: u64,
        size: u64,
        #[serde(default)]
        flush: bool,
    },
    Flush,
}

pub async fn patch_image(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(body): Json<PatchBody>,
) -> Result<Response, HttpError> {
    match body {
        PatchBody::Zero { offset, size, flush } => {
            let status = state.tickets.get(&ticket_id).ok_or(TicketError::NotFound).map_err(data_plane)?;
            let lease = state.tickets.authorize(&ticket_id, Operation::Write, Some((offset, offset + size))).map_err(data_plane)?;
            let conf = state.conf_handle.get_conf();
            let backend = state.tickets.backend_for(&ticket_id, conf.nbd_concurrency, conf.tls_ca.as_deref()).await?;
            let punch_hole = status.sparse && backend.features().zero;
            backend.zero(offset, size, flush, punch_hole).await?;
            lease.record_bytes(size);
        }
        PatchBody::Flush => {
            let lease = state.tickets.authorize(&ticket_id, Operation::Write, None).map_err(data_plane)?;
            let conf = state.conf_handle.get_conf();
            let backend = state.tickets.backend_for(&ticket_id, conf.nbd_concurrency, conf.tls_ca.as_deref()).await?;
            backend.flush().await?;
            let _ = lease;
        }
    }
    Ok(StatusCode::OK.into_response())
}

#[derive(Deserialize)]
pub struct ExtentsQuery {
    #[serde(default = "default_context")]
    context: String,
    bitmap: Option<String>,
}

fn default_context() -> String {
    "zero".to_owned()
}

#[derive(Serialize)]
struct WireExtent {
    start: u64,
    length: u64,
    zero: bool,
    hole: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    dirty: Option<bool>,
}

pub async fn get_extents(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<ExtentsQuery>,
) -> Result<Response, HttpError> {
    let status = state.tickets.get(&ticket_id).ok_or(TicketError::NotFound).map_err(data_plane)?;
    let lease = state.tickets.authorize(&ticket_id, Operation::Read, None).map_err(data_plane)?;
    let conf = state.conf_handle.get_conf();
    let backend = state.tickets.backend_for(&ticket_id, conf.nbd_concurrency, conf.tls_ca.as_deref()).await?;

    let context = match query.context.as_str() {
        "zero" => ExtentContext::Zero,
        "dirty" => {
            if !status.dirty {
                return Err(HttpError::not_found("ticket does not enable dirty-extent tracking"));
            }
            let bitmap = query.bitmap.ok_or_else(|| HttpError::bad_request("dirty context requires a bitmap name"))?;
            ExtentContext::Dirty(bitmap)
        }
        other => return Err(HttpError::bad_request(format!("unknown extents context: {other}"))),
    };

    let extents = backend.extents(context).await?;
    drop(lease);

    let wire: Vec<WireExtent> = extents
        .into_iter()
        .map(|e| WireExtent { start: e.start, length: e.length, zero: e.zero, hole: e.hole, dirty: e.dirty })
        .collect();
    Ok(Json(wire).into_response())
}
