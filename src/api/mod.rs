pub mod service;

use actix_web::{get, http::StatusCode, post, web, HttpResponse, Responder, ResponseError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::api::service::{ApiError, NetweaveApiService};
use crate::config::{BridgeSpec, ContainerIfaceSpec, VethPairSpec};

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Apply(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            detail: self.to_string(),
        })
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AddBridgeRequest {
    pub bridge_name: String,
    pub bridge_info: BridgeSpec,
}

#[derive(Serialize, Deserialize)]
pub struct BridgeResponse {
    pub status: String,
    pub bridge_name: String,
}

#[post("/add_bridge")]
pub async fn add_bridge_route(
    body: web::Json<AddBridgeRequest>,
    service: web::Data<NetweaveApiService>,
) -> Result<impl Responder, ApiError> {
    debug!("received add_bridge request body: {:?}", body);
    let AddBridgeRequest {
        bridge_name,
        bridge_info,
    } = body.into_inner();

    service
        .add_bridge(&bridge_name, &bridge_info)
        .await
        .map_err(|err| {
            error!("error while adding bridge {}: {}", bridge_name, err);
            err
        })?;

    info!("bridge {} applied", bridge_name);
    Ok(web::Json(BridgeResponse {
        status: "success".to_string(),
        bridge_name,
    }))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AddContainerIfaceRequest {
    pub container_id: String,
    pub container_info: ContainerIfaceSpec,
}

#[derive(Serialize, Deserialize)]
pub struct ContainerResponse {
    pub status: String,
    pub container_id: String,
}

#[post("/add_container_iface")]
pub async fn add_container_iface_route(
    body: web::Json<AddContainerIfaceRequest>,
    service: web::Data<NetweaveApiService>,
) -> Result<impl Responder, ApiError> {
    debug!("received add_container_iface request body: {:?}", body);
    let AddContainerIfaceRequest {
        container_id,
        container_info,
    } = body.into_inner();

    service
        .add_container_iface(&container_id, &container_info)
        .await
        .map_err(|err| {
            error!("error while attaching container {}: {}", container_id, err);
            err
        })?;

    info!("interface {} applied for container {}", container_info.iface, container_id);
    Ok(web::Json(ContainerResponse {
        status: "success".to_string(),
        container_id,
    }))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AddVethPairRequest {
    pub veth_pair_id: String,
    pub veth_pair_info: VethPairSpec,
}

#[derive(Serialize, Deserialize)]
pub struct VethPairResponse {
    pub status: String,
    pub veth_pair_id: String,
}

#[post("/add_veth_pair")]
pub async fn add_veth_pair_route(
    body: web::Json<AddVethPairRequest>,
    service: web::Data<NetweaveApiService>,
) -> Result<impl Responder, ApiError> {
    debug!("received add_veth_pair request body: {:?}", body);
    let AddVethPairRequest {
        veth_pair_id,
        mut veth_pair_info,
    } = body.into_inner();

    if veth_pair_info.map.is_empty() {
        veth_pair_info.map = ":".to_string();
    }

    service
        .add_veth_pair(&veth_pair_id, &veth_pair_info)
        .await
        .map_err(|err| {
            error!("error while adding veth pair {}: {}", veth_pair_id, err);
            err
        })?;

    info!("veth pair {} applied", veth_pair_id);
    Ok(web::Json(VethPairResponse {
        status: "success".to_string(),
        veth_pair_id,
    }))
}

#[derive(Serialize, Deserialize)]
pub struct Banner {
    pub message: String,
}

#[get("/")]
pub async fn index_route() -> impl Responder {
    web::Json(Banner {
        message: "netweave network orchestrator API".to_string(),
    })
}
