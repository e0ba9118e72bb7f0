//! Route handlers

use crate::auth::OperatorClaims;
use crate::dto::{CreateRegistrationBody, CreatedRegistration, RegistrationList, RegistrationView};
use crate::error::ApiError;
use crate::ApiState;
use lifecycle_core::{RegistrationId, RegistrationPatch};
use warp::http::StatusCode;
use warp::{Rejection, Reply};

fn reject(err: impl Into<ApiError>) -> Rejection {
    warp::reject::custom(err.into())
}

pub(crate) async fn create(
    claims: OperatorClaims,
    body: CreateRegistrationBody,
    state: ApiState,
) -> Result<impl Reply, Rejection> {
    let registration = state
        .control_plane
        .register(body.into())
        .await
        .map_err(reject)?;
    tracing::info!(
        operator = %claims.sub,
        registration_id = %registration.id,
        tenant_id = %registration.tenant_id,
        "tenant registered"
    );
    Ok(warp::reply::with_status(
        warp::reply::json(&CreatedRegistration::from(&registration)),
        StatusCode::CREATED,
    ))
}

pub(crate) async fn list(_claims: OperatorClaims, state: ApiState) -> Result<impl Reply, Rejection> {
    let registrations = state.control_plane.list().await.map_err(reject)?;
    Ok(warp::reply::json(&RegistrationList {
        registrations: registrations.iter().map(RegistrationView::from).collect(),
    }))
}

pub(crate) async fn get(
    id: RegistrationId,
    _claims: OperatorClaims,
    state: ApiState,
) -> Result<impl Reply, Rejection> {
    let registration = state.control_plane.get(id).await.map_err(reject)?;
    Ok(warp::reply::json(&RegistrationView::from(&registration)))
}

pub(crate) async fn update(
    id: RegistrationId,
    claims: OperatorClaims,
    patch: RegistrationPatch,
    state: ApiState,
) -> Result<impl Reply, Rejection> {
    let registration = state
        .control_plane
        .update(id, patch)
        .await
        .map_err(reject)?;
    tracing::info!(operator = %claims.sub, registration_id = %id, "registration updated");
    Ok(warp::reply::json(&RegistrationView::from(&registration)))
}

pub(crate) async fn deprovision(
    id: RegistrationId,
    claims: OperatorClaims,
    state: ApiState,
) -> Result<impl Reply, Rejection> {
    let registration = state.control_plane.deprovision(id).await.map_err(reject)?;
    tracing::info!(operator = %claims.sub, registration_id = %id, "deprovisioning requested");
    Ok(warp::reply::with_status(
        warp::reply::json(&RegistrationView::from(&registration)),
        StatusCode::ACCEPTED,
    ))
}
