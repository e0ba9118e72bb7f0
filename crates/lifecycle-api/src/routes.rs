//! Route table
//!
//! | Method | Path | Success |
//! |---|---|---|
//! | `POST` | `/tenant-registrations` | `201` |
//! | `GET` | `/tenant-registrations` | `200` |
//! | `GET` | `/tenant-registrations/{id}` | `200` |
//! | `PATCH` | `/tenant-registrations/{id}` | `200` |
//! | `DELETE` | `/tenant-registrations/{id}` | `202` |

use crate::auth::OperatorClaims;
use crate::dto::CreateRegistrationBody;
use crate::error::{handle_rejection, ApiError};
use crate::handlers;
use crate::ApiState;
use lifecycle_core::{RegistrationId, RegistrationPatch};
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Every management route, with rejections rendered as error bodies
pub fn routes(
    state: ApiState,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let collection = warp::path("tenant-registrations").and(warp::path::end());
    let item = warp::path!("tenant-registrations" / RegistrationId);

    let create = collection
        .clone()
        .and(warp::post())
        .and(authorized(state.clone()))
        .and(json_body::<CreateRegistrationBody>())
        .and(with_state(state.clone()))
        .and_then(handlers::create);

    let list = collection
        .and(warp::get())
        .and(authorized(state.clone()))
        .and(with_state(state.clone()))
        .and_then(handlers::list);

    let get = item
        .clone()
        .and(warp::get())
        .and(authorized(state.clone()))
        .and(with_state(state.clone()))
        .and_then(handlers::get);

    let update = item
        .clone()
        .and(warp::patch())
        .and(authorized(state.clone()))
        .and(json_body::<RegistrationPatch>())
        .and(with_state(state.clone()))
        .and_then(handlers::update);

    let deprovision = item
        .and(warp::delete())
        .and(authorized(state.clone()))
        .and(with_state(state))
        .and_then(handlers::deprovision);

    create
        .or(list)
        .or(get)
        .or(update)
        .or(deprovision)
        .recover(handle_rejection)
        .with(warp::trace::request())
}

fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn authorized(
    state: ApiState,
) -> impl Filter<Extract = (OperatorClaims,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_state(state))
        .and_then(|header: Option<String>, state: ApiState| async move {
            state
                .verifier
                .authorize(header.as_deref())
                .map_err(|e| {
                    tracing::debug!(error = %e, "request not authorized");
                    warp::reject::custom(ApiError::from(e))
                })
        })
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}
