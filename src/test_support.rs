//! In-process fakes for the gateway, the catalog and the admin API.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::api::{ApiError, SyncApi};
use crate::cart::model::{AppliedDiscount, OrderRef, ProductRef};
use crate::catalog::CatalogLookup;
use crate::gateway::{Gateway, GatewayError, OperationEnvelope, OrderDraft};
use crate::operations::OperationKind;

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Scripted gateway. Sends answer from the queued responses, then `{}`.
pub struct FakeGateway {
    offline: AtomicBool,
    responses: Mutex<VecDeque<Result<Value, GatewayError>>>,
    sent: Mutex<Vec<OperationEnvelope>>,
    initialized: Mutex<Vec<OrderRef>>,
    cleared: AtomicUsize,
}

impl FakeGateway {
    fn with_mode(offline: bool) -> Arc<Self> {
        Arc::new(Self {
            offline: AtomicBool::new(offline),
            responses: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            initialized: Mutex::new(Vec::new()),
            cleared: AtomicUsize::new(0),
        })
    }

    pub fn online() -> Arc<Self> {
        Self::with_mode(false)
    }

    pub fn offline() -> Arc<Self> {
        Self::with_mode(true)
    }

    pub fn push_response(&self, response: Result<Value, GatewayError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> Option<OperationEnvelope> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn sent_kinds(&self) -> Vec<OperationKind> {
        self.sent.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn cleared_count(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> Vec<OrderRef> {
        self.initialized.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn send_cart_operation(
        &self,
        envelope: &OperationEnvelope,
    ) -> Result<Value, GatewayError> {
        self.sent.lock().unwrap().push(envelope.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({})))
    }

    async fn get_or_create_order_id(&self, _draft: &OrderDraft) -> Result<OrderRef, GatewayError> {
        if self.is_offline_mode() {
            Ok(OrderRef::new_local())
        } else {
            Ok(OrderRef::Server("ord-1".into()))
        }
    }

    fn is_offline_mode(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    async fn initialize_connection(&self, order: &OrderRef) -> Result<(), GatewayError> {
        self.initialized.lock().unwrap().push(order.clone());
        Ok(())
    }

    fn clear_local_order_id(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticCatalog {
    products: HashMap<String, ProductRef>,
    discounts: Vec<AppliedDiscount>,
}

impl StaticCatalog {
    pub fn with_products(products: Vec<ProductRef>) -> Self {
        Self {
            products: products
                .into_iter()
                .map(|p| (p.product_id.clone(), p))
                .collect(),
            discounts: Vec::new(),
        }
    }
}

impl CatalogLookup for StaticCatalog {
    fn product(&self, product_id: &str) -> Option<ProductRef> {
        self.products.get(product_id).cloned()
    }

    fn discount(&self, discount_id: &str) -> Option<AppliedDiscount> {
        self.discounts
            .iter()
            .find(|d| d.discount_id == discount_id)
            .cloned()
    }

    fn discount_by_code(&self, code: &str) -> Option<AppliedDiscount> {
        self.discounts
            .iter()
            .find(|d| d.code.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(code)))
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Admin API
// ---------------------------------------------------------------------------

/// Per-path response queues. A path with nothing queued answers
/// `ApiError::Unreachable`.
pub struct FakeApi {
    reachable: AtomicBool,
    responses: Mutex<HashMap<String, VecDeque<Result<Value, ApiError>>>>,
    requests: Mutex<Vec<(String, Value)>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, path: &str, response: Result<Value, ApiError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl SyncApi for FakeApi {
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.requests
            .lock()
            .unwrap()
            .push((path.to_string(), body.clone()));
        self.responses
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(ApiError::Unreachable(format!("no response queued for {path}"))))
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
