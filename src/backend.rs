//! Room backend
//!
//! In direct mode the host announces the UDP endpoint it listens on and gets a
//! short room id back; players trade that id for the endpoint. This module
//! holds both sides: the HTTP client used by `direct-host`/`direct-player`
//! and the in-memory directory served by the `backend` subcommand.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rouille::{Request, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BackendError;

pub const DEFAULT_BACKEND_PORT: u16 = 3000;

const ROOM_ID_LEN: usize = 7;
const ROOM_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PUBLIC_IP_URL: &str = "https://api.ipify.org";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub player_ip: Option<String>,
    pub player_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub sala_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub sala_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEndpoint {
    pub player_ip: String,
    pub player_port: u16,
}

impl RoomEndpoint {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.player_ip.parse()?;
        Ok(SocketAddr::new(ip, self.player_port))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct BackendClient {
    base: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base: impl Into<String>) -> Self {
        BackendClient {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Announce `ip:port` and return the new room id.
    pub async fn create_room(&self, ip: &str, port: u16) -> Result<String, BackendError> {
        let body = CreateRoomRequest {
            player_ip: Some(ip.to_string()),
            player_port: Some(port),
        };
        let resp = self
            .http
            .post(format!("{}/sala/crear", self.base))
            .json(&body)
            .send()
            .await?;
        let created: RoomCreated = expect_status(resp, 201).await?.json().await?;
        Ok(created.sala_id)
    }

    pub async fn join_room(&self, room: &str) -> Result<RoomEndpoint, BackendError> {
        let body = JoinRoomRequest {
            sala_id: Some(room.to_string()),
        };
        let resp = self
            .http
            .post(format!("{}/sala/unirse", self.base))
            .json(&body)
            .send()
            .await?;
        Ok(expect_status(resp, 200).await?.json().await?)
    }

    /// Address this host is seen from on the Internet.
    pub async fn public_ip(&self) -> Result<String, BackendError> {
        let resp = self.http.get(PUBLIC_IP_URL).send().await?;
        Ok(expect_status(resp, 200).await?.text().await?.trim().to_string())
    }
}

async fn expect_status(
    resp: reqwest::Response,
    expected: u16,
) -> Result<reqwest::Response, BackendError> {
    let status = resp.status().as_u16();
    if status == expected {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::UnexpectedStatus { status, body })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub host: RoomEndpoint,
    pub joined_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// In-memory room directory behind the backend HTTP routes.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: Mutex<HashMap<String, Room>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, request: &Request) -> Response {
        rouille::router!(request,
            (POST) (/sala/crear) => { self.create(request) },
            (POST) (/sala/unirse) => { self.join(request) },
            (GET) (/salas) => { self.list() },
            _ => Response::empty_404()
        )
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.lock().is_empty()
    }

    fn create(&self, request: &Request) -> Response {
        let body: CreateRoomRequest = match rouille::input::json_input(request) {
            Ok(body) => body,
            Err(_) => return error(400, "Faltan playerIp y playerPort"),
        };
        let (ip, port) = match (body.player_ip, body.player_port) {
            (Some(ip), Some(port)) if !ip.is_empty() && port != 0 => (ip, port),
            _ => return error(400, "Faltan playerIp y playerPort"),
        };

        let mut rooms = self.rooms.lock();
        let id = loop {
            let id = room_id();
            if !rooms.contains_key(&id) {
                break id;
            }
        };
        info!("Room {} created for {}:{}", id, ip, port);
        rooms.insert(
            id.clone(),
            Room {
                id: id.clone(),
                host: RoomEndpoint {
                    player_ip: ip,
                    player_port: port,
                },
                joined_by: None,
                created_at: Utc::now(),
            },
        );
        Response::json(&RoomCreated { sala_id: id }).with_status_code(201)
    }

    fn join(&self, request: &Request) -> Response {
        let room_id = match rouille::input::json_input::<JoinRoomRequest>(request) {
            Ok(JoinRoomRequest { sala_id: Some(id) }) => id,
            _ => return error(404, "La sala no existe."),
        };
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(&room_id) {
            Some(room) => {
                let from = request.remote_addr().ip().to_string();
                info!("{} joined room {}", from, room_id);
                room.joined_by = Some(from);
                Response::json(&room.host)
            }
            None => error(404, "La sala no existe."),
        }
    }

    fn list(&self) -> Response {
        Response::json(&*self.rooms.lock())
    }
}

fn error(status: u16, message: &str) -> Response {
    Response::json(&ErrorBody {
        error: message.to_string(),
    })
    .with_status_code(status)
}

fn room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_CHARSET[rng.gen_range(0..ROOM_ID_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn post(url: &str, body: &str) -> Request {
        Request::fake_http(
            "POST",
            url,
            vec![("Content-Type".to_owned(), "application/json".to_owned())],
            body.as_bytes().to_vec(),
        )
    }

    fn body_of(response: Response) -> serde_json::Value {
        let (mut reader, _) = response.data.into_reader_and_size();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[test]
    fn test_room_ids_are_short_base36() {
        let id = room_id();
        assert_eq!(id.len(), ROOM_ID_LEN);
        assert!(id.bytes().all(|b| ROOM_ID_CHARSET.contains(&b)));
    }

    #[test]
    fn test_create_then_join() {
        let dir = RoomDirectory::new();
        let created = dir.handle(&post(
            "/sala/crear",
            r#"{"playerIp":"203.0.113.9","playerPort":5001}"#,
        ));
        assert_eq!(created.status_code, 201);
        let id = body_of(created)["salaId"].as_str().unwrap().to_string();

        let joined = dir.handle(&post("/sala/unirse", &format!(r#"{{"salaId":"{id}"}}"#)));
        assert_eq!(joined.status_code, 200);
        let endpoint: RoomEndpoint = serde_json::from_value(body_of(joined)).unwrap();
        assert_eq!(
            endpoint.socket_addr().unwrap(),
            "203.0.113.9:5001".parse().unwrap()
        );
    }

    #[test]
    fn test_create_requires_both_fields() {
        let dir = RoomDirectory::new();
        let resp = dir.handle(&post("/sala/crear", r#"{"playerIp":"203.0.113.9"}"#));
        assert_eq!(resp.status_code, 400);
        assert!(body_of(resp)["error"].is_string());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_join_unknown_room() {
        let dir = RoomDirectory::new();
        let resp = dir.handle(&post("/sala/unirse", r#"{"salaId":"nope123"}"#));
        assert_eq!(resp.status_code, 404);
    }

    #[test]
    fn test_list_rooms() {
        let dir = RoomDirectory::new();
        dir.handle(&post(
            "/sala/crear",
            r#"{"playerIp":"198.51.100.1","playerPort":7000}"#,
        ));
        let list = dir.handle(&Request::fake_http("GET", "/salas", vec![], vec![]));
        assert_eq!(list.status_code, 200);
        let rooms = body_of(list);
        let room = rooms.as_object().unwrap().values().next().unwrap();
        assert_eq!(room["host"]["playerPort"], 7000);
        assert!(room["joinedBy"].is_null());
    }

    #[test]
    fn test_unknown_route() {
        let dir = RoomDirectory::new();
        let resp = dir.handle(&Request::fake_http("GET", "/nope", vec![], vec![]));
        assert_eq!(resp.status_code, 404);
    }
}
