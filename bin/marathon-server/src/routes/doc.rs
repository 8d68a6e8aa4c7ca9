use utoipa::OpenApi;

use crate::routes::{events, health, tasks};

#[derive(OpenApi)]
#[openapi(info(
    title = "marathon-server",
    description = "Marathon task orchestrator API",
    version = "0.1.0",
    contact(name = "marathon", url = "https://github.com/marathon-rs/marathon")
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(tasks::TasksApi::openapi());
    root.merge(events::EventsApi::openapi());
    root
}
