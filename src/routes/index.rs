use crate::server::SharedState;
use axum::{extract::State, response::Html};

const INDEX_PAGE: &str = include_str!("../../static/index.html");

pub async fn index(State(state): State<SharedState>) -> Html<&'static str> {
    state.metrics.record_request("/");
    Html(INDEX_PAGE)
}
