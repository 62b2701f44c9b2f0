pub mod images;
pub mod tickets;

use axum::Router;
use axum::routing::{get, put};

use crate::state::AppState;

/// The data-plane router: `GET`/`PUT`/`PATCH`/`OPTIONS` on `/images/{id}`, backed by whatever
/// the ticket's `url` points at. Mounted on both the remote TLS listener and the local unix
/// socket listener.
pub fn images_router() -> Router<AppState> {
    Router::new()
        .route(
            "/images/{ticket_id}",
            get(images::get_image).put(images::put_image).patch(images::patch_image).options(images::options_image),
        )
        .route("/images/{ticket_id}/extents", get(images::get_extents))
}

/// The control-plane router: ticket CRUD, plus the `/images/*` capability probe (the literal `*`
/// ticket id reports server-wide capabilities via a synthetic all-verbs ticket; a real ticket id
/// here behaves the same as on the data-plane listeners). Mounted only on the control listener.
pub fn tickets_router() -> Router<AppState> {
    Router::new()
        .route("/tickets/", get(tickets::list_tickets))
        .route(
            "/tickets/{ticket_id}",
            put(tickets::put_ticket).get(tickets::get_ticket).patch(tickets::patch_ticket).delete(tickets::delete_ticket),
        )
        .route("/images/{ticket_id}", axum::routing::options(images::options_image))
}
