use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    routing,
};
use rearch::Container;
use snipurl::{
    api::{self, CreateLinkPayload, DeletedLink, LinkRecord},
    config,
    link_service::{
        self, CreateLinkError, DeleteLinkError, GetLinkError, ListLinksError,
        link_rest_service_capsule,
    },
};
use tokio::net::TcpListener;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;

    let app = app(container.clone());

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(listener, app).await?;
    Ok(())
}

fn app(container: Container) -> Router {
    Router::new()
        .route("/links", routing::post(create_link).get(list_links))
        .route("/links/{code}", routing::get(get_link).delete(delete_link))
        .route("/{code}", routing::get(follow_link))
        .with_state(container)
}

#[instrument(skip(container, payload))]
async fn create_link(
    State(container): State<Container>,
    payload: Result<Json<CreateLinkPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<LinkRecord>), (StatusCode, Json<api::Error>)> {
    // A body the extractor cannot read is a client error, not a 422.
    let Json(CreateLinkPayload { url }) = payload.map_err(|rejection| {
        let err_uuid = Uuid::new_v4();
        info!(?err_uuid, %rejection, "User submitted an unreadable payload");
        (
            StatusCode::BAD_REQUEST,
            Json(api::Error {
                error: rejection.body_text(),
                error_id: err_uuid.to_string(),
            }),
        )
    })?;

    container
        .read(link_rest_service_capsule)
        .create_link(&url)
        .await
        .map(|record| (StatusCode::CREATED, Json(record)))
        .map_err(|error: CreateLinkError| {
            let err_uuid = Uuid::new_v4();
            match error {
                CreateLinkError::InvalidUrl(_) => {
                    info!(?err_uuid, ?error, "User submitted a bad URL");
                    (
                        StatusCode::BAD_REQUEST,
                        Json(api::Error {
                            error: error.to_string(),
                            error_id: err_uuid.to_string(),
                        }),
                    )
                }
                CreateLinkError::SlugSpaceExhausted | CreateLinkError::Internal(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(api::Error {
                            error: "Internal server error".to_owned(),
                            error_id: err_uuid.to_string(),
                        }),
                    )
                }
            }
        })
}

#[instrument(skip(container))]
async fn list_links(State(container): State<Container>) -> impl IntoResponse {
    container
        .read(link_rest_service_capsule)
        .list_links()
        .await
        .map(Json)
        .map_err(|error: ListLinksError| {
            let err_uuid = Uuid::new_v4();
            error!(?err_uuid, ?error, "Encountered an error during a request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(api::Error {
                    error: "Internal server error".to_owned(),
                    error_id: err_uuid.to_string(),
                }),
            )
        })
}

#[instrument(skip(container))]
async fn get_link(
    State(container): State<Container>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    container
        .read(link_rest_service_capsule)
        .get_link(&code)
        .await
        .map(Json)
        .map_err(|error| get_link_error_response(&error))
}

#[instrument(skip(container))]
async fn delete_link(
    State(container): State<Container>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    container
        .read(link_rest_service_capsule)
        .delete_link(&code)
        .await
        .map(|record| {
            Json(DeletedLink {
                message: "Deleted".to_owned(),
                data: record,
            })
        })
        .map_err(|error: DeleteLinkError| {
            let err_uuid = Uuid::new_v4();
            match error {
                DeleteLinkError::InvalidSlug(_) => {
                    info!(?err_uuid, ?error, "User submitted a malformed slug");
                    (
                        StatusCode::BAD_REQUEST,
                        Json(api::Error {
                            error: error.to_string(),
                            error_id: err_uuid.to_string(),
                        }),
                    )
                }
                DeleteLinkError::NotFound => (
                    StatusCode::NOT_FOUND,
                    Json(api::Error {
                        error: error.to_string(),
                        error_id: err_uuid.to_string(),
                    }),
                ),
                DeleteLinkError::Internal(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(api::Error {
                            error: "Internal server error".to_owned(),
                            error_id: err_uuid.to_string(),
                        }),
                    )
                }
            }
        })
}

#[instrument(skip(container))]
async fn follow_link(
    State(container): State<Container>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    container
        .read(link_rest_service_capsule)
        .resolve_link(&code)
        .await
        .map(|link_service::Redirect { url }| Redirect::temporary(&url))
        .map_err(|error| get_link_error_response(&error))
}

fn get_link_error_response(error: &GetLinkError) -> (StatusCode, Json<api::Error>) {
    let err_uuid = Uuid::new_v4();
    match error {
        GetLinkError::InvalidSlug(_) => {
            info!(?err_uuid, ?error, "User submitted a malformed slug");
            (
                StatusCode::BAD_REQUEST,
                Json(api::Error {
                    error: error.to_string(),
                    error_id: err_uuid.to_string(),
                }),
            )
        }
        GetLinkError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(api::Error {
                error: "Not found".to_owned(),
                error_id: err_uuid.to_string(),
            }),
        ),
        GetLinkError::Internal(_) => {
            error!(?err_uuid, ?error, "Encountered an error during a request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(api::Error {
                    error: "Internal server error".to_owned(),
                    error_id: err_uuid.to_string(),
                }),
            )
        }
    }
}
