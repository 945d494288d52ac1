//! In-memory KME pair for integration tests
//!
//! Both SAEs of a test talk to the same `FakeKme`, which plays the role of the
//! two KMEs and the QKD link between them: keys issued through `enc_keys` for
//! SAE B are retrievable by SAE B through `dec_keys`.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use rand::RngCore;
use zeroize::Zeroizing;

use qkd014_client::protocol::wire::{
    ErrorResponse, KeyAndId, KeyContainer, KeyIdsRequest, KeyRequest, StatusResponse,
};
use qkd014_client::session::Session;
use qkd014_client::transport::{KmeRequest, KmeResponse, KmeTransport};
use qkd014_client::{KmeError, KmeResult};

pub const API_PREFIX: &str = "/api/v1/keys/";
pub const MIN_KEY_SIZE: u32 = 64;
pub const MAX_KEY_SIZE: u32 = 1024;
pub const MAX_KEY_PER_REQUEST: u32 = 128;

struct IssuedKey {
    issuer: String,
    target: String,
    bytes: Zeroizing<Vec<u8>>,
}

pub struct FakeKme {
    known_saes: Vec<String>,
    issued: HashMap<String, IssuedKey>,
    pub stored_key_count: u32,
    /// Deliver `dec_keys` results in reverse order
    pub reverse_order: bool,
    /// Deliver at most this many keys per `enc_keys` request
    pub partial_fill: Option<usize>,
    /// Answer the next request with this status and body
    pub next_response: Option<(u16, String)>,
    pub time_out_next: bool,
    pub calls: usize,
    pub last_body: Option<String>,
}

pub type SharedKme = Rc<RefCell<FakeKme>>;

impl FakeKme {
    pub fn new(known_saes: &[&str]) -> SharedKme {
        Rc::new(RefCell::new(Self {
            known_saes: known_saes.iter().map(|s| s.to_string()).collect(),
            issued: HashMap::new(),
            stored_key_count: 1000,
            reverse_order: false,
            partial_fill: None,
            next_response: None,
            time_out_next: false,
            calls: 0,
            last_body: None,
        }))
    }

    fn handle(&mut self, caller: &str, request: &KmeRequest) -> KmeResult<KmeResponse> {
        self.calls += 1;
        self.last_body = request.body.clone();

        if self.time_out_next {
            self.time_out_next = false;
            return Err(KmeError::timeout(&request.path, "operation timed out"));
        }
        if let Some((status, body)) = self.next_response.take() {
            return Ok(KmeResponse::new(status, body));
        }

        let rest = request.path.strip_prefix(API_PREFIX).unwrap_or_default();
        let (sae_id, resource) = match rest.split_once('/') {
            Some(parts) => parts,
            None => return Ok(error(404, "not found")),
        };

        match resource {
            "status" => Ok(self.status(caller, sae_id)),
            "enc_keys" => Ok(self.enc_keys(caller, sae_id, request.body.as_deref().unwrap_or("{}"))),
            "dec_keys" => Ok(self.dec_keys(caller, sae_id, request.body.as_deref().unwrap_or("{}"))),
            _ => Ok(error(404, "not found")),
        }
    }

    fn knows(&self, sae_id: &str) -> bool {
        self.known_saes.iter().any(|known| known == sae_id)
    }

    fn status(&self, caller: &str, target: &str) -> KmeResponse {
        if !self.knows(target) {
            return error(400, "slave SAE unknown");
        }
        let status = StatusResponse {
            source_kme_id: format!("KME-{}", caller),
            target_kme_id: format!("KME-{}", target),
            source_sae_id: caller.to_string(),
            target_sae_id: target.to_string(),
            key_size: 256,
            stored_key_count: self.stored_key_count,
            max_key_count: 100_000,
            max_key_per_request: MAX_KEY_PER_REQUEST,
            max_key_size: MAX_KEY_SIZE,
            min_key_size: MIN_KEY_SIZE,
            max_sae_id_count: 2,
            status_extension: None,
        };
        KmeResponse::new(200, serde_json::to_string(&status).unwrap())
    }

    fn enc_keys(&mut self, caller: &str, target: &str, body: &str) -> KmeResponse {
        if !self.knows(target) {
            return error(400, "slave SAE unknown");
        }
        let request: KeyRequest = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(_) => return error(400, "malformed request"),
        };
        if request.size % 8 != 0 || request.size < MIN_KEY_SIZE || request.size > MAX_KEY_SIZE {
            return error(400, "requested size is not supported");
        }
        if request.number > self.stored_key_count || request.number > MAX_KEY_PER_REQUEST {
            return error(400, "number of requested keys exceeds stored keys");
        }

        let delivered = self
            .partial_fill
            .map_or(request.number as usize, |limit| limit.min(request.number as usize));
        let mut keys = Vec::with_capacity(delivered);
        for _ in 0..delivered {
            let key_id = uuid::Uuid::new_v4().to_string();
            let mut bytes = Zeroizing::new(vec![0u8; (request.size / 8) as usize]);
            rand::thread_rng().fill_bytes(&mut bytes[..]);

            keys.push(KeyAndId {
                key_id: key_id.clone(),
                key: Zeroizing::new(base64::encode(&bytes[..])),
            });
            self.issued.insert(
                key_id,
                IssuedKey {
                    issuer: caller.to_string(),
                    target: target.to_string(),
                    bytes,
                },
            );
        }
        self.stored_key_count -= delivered as u32;

        container(keys)
    }

    fn dec_keys(&mut self, caller: &str, issuer: &str, body: &str) -> KmeResponse {
        if !self.knows(issuer) {
            return error(400, "master SAE unknown");
        }
        let request: KeyIdsRequest = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(_) => return error(400, "malformed request"),
        };

        let all_known = request.key_ids.iter().all(|entry| {
            self.issued
                .get(&entry.key_id)
                .map_or(false, |key| key.issuer == issuer && key.target == caller)
        });
        if !all_known {
            return error(400, "key_ID not found");
        }

        let mut keys: Vec<KeyAndId> = request
            .key_ids
            .iter()
            .filter_map(|entry| self.issued.remove(&entry.key_id).map(|key| (entry, key)))
            .map(|(entry, key)| KeyAndId {
                key_id: entry.key_id.clone(),
                key: Zeroizing::new(base64::encode(&key.bytes[..])),
            })
            .collect();
        if self.reverse_order {
            keys.reverse();
        }

        container(keys)
    }
}

fn container(keys: Vec<KeyAndId>) -> KmeResponse {
    let container = KeyContainer {
        keys,
        key_container_extension: None,
    };
    KmeResponse::new(200, serde_json::to_string(&container).unwrap())
}

fn error(status: u16, message: &str) -> KmeResponse {
    let body = ErrorResponse {
        message: message.to_string(),
        details: None,
    };
    KmeResponse::new(status, serde_json::to_string(&body).unwrap())
}

/// Transport of one SAE to the shared fake KME
pub struct FakeTransport {
    sae_id: String,
    kme: SharedKme,
    /// Number of times the session closed this transport
    pub closes: Rc<Cell<u32>>,
}

impl KmeTransport for FakeTransport {
    fn execute(&mut self, request: &KmeRequest) -> KmeResult<KmeResponse> {
        self.kme.borrow_mut().handle(&self.sae_id, request)
    }

    fn endpoint(&self) -> &str {
        "fake-kme:443"
    }

    fn close(&mut self) {
        self.closes.set(self.closes.get() + 1);
    }
}

pub fn session(kme: &SharedKme, sae_id: &str) -> Session<FakeTransport> {
    Session::with_transport(FakeTransport {
        sae_id: sae_id.to_string(),
        kme: Rc::clone(kme),
        closes: Rc::new(Cell::new(0)),
    })
}

/// A fake KME that knows `sae-a` and `sae-b`, with a session for each
pub fn pair() -> (SharedKme, Session<FakeTransport>, Session<FakeTransport>) {
    let kme = FakeKme::new(&["sae-a", "sae-b"]);
    let a = session(&kme, "sae-a");
    let b = session(&kme, "sae-b");
    (kme, a, b)
}

pub fn calls(kme: &SharedKme) -> usize {
    kme.borrow().calls
}
