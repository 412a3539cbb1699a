//! Data Models
//! Emergency, ServiceRequest, ShopOffer, PaymentTransaction, Notification などのデータ構造定義

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

// ========================================
// Status / Kind enums
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ServiceType {
    Vulcanize,
    Repair,
    Gas,
}

impl ServiceType {
    /// この依頼に対応できる店舗の種類
    pub fn shop_type(self) -> ShopType {
        match self {
            ServiceType::Vulcanize => ShopType::Vulcanizer,
            ServiceType::Repair => ShopType::Mechanic,
            ServiceType::Gas => ShopType::GasStation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ShopType {
    Mechanic,
    Vulcanizer,
    GasStation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EmergencyStatus {
    Waiting,
    InProcess,
    Completed,
    Canceled,
}

impl EmergencyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EmergencyStatus::Completed | EmergencyStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    ToPay,
    Paid,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NotificationType {
    EmergencyPosted,
    NewOfferReceived,
    ServiceRequestAccepted,
    ServiceRequestRejected,
    PaymentReceived,
    EmergencyCompleted,
    System,
}

// ========================================
// Shop
// ========================================

/// Shop (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shop {
    pub id: String,
    pub owner_user_id: String,
    pub name: String,
    pub shop_type: ShopType,
    pub latitude: f64,
    pub longitude: f64,
    pub phone: Option<String>,
    pub created_at: i64,
}

/// Shop 登録リクエスト
#[derive(Debug, Deserialize)]
pub struct RegisterShopRequest {
    pub name: String,
    pub shop_type: ShopType,
    pub latitude: f64,
    pub longitude: f64,
    pub phone: Option<String>,
}

// ========================================
// Emergency
// ========================================

/// Emergency (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Emergency {
    pub id: String,
    pub requester_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub vehicle_type: String,
    pub service_type: ServiceType,
    pub fuel_type: Option<String>,
    pub description: Option<String>,
    pub status: EmergencyStatus,
    pub accepted_shop_user_id: Option<String>,
    pub created_at: i64,             // Unix秒
    pub accepted_at: Option<i64>,    // Unix秒
    pub completed_at: Option<i64>,   // Unix秒
    pub canceled_at: Option<i64>,    // Unix秒
    pub hidden_by_requester: bool,
}

/// Emergency 作成リクエスト
#[derive(Debug, Deserialize)]
pub struct CreateEmergencyRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub vehicle_type: String,
    pub service_type: ServiceType,
    pub fuel_type: Option<String>,
    pub description: Option<String>,
}

// ========================================
// ServiceRequest
// ========================================

/// ServiceRequest (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceRequest {
    pub id: String,
    pub emergency_id: String,
    pub shop_id: String,
    pub shop_latitude: f64,
    pub shop_longitude: f64,
    pub status: RequestStatus,
    pub requested_at: i64,
    pub accepted_at: Option<i64>,
    pub rejected_at: Option<i64>,
}

// ========================================
// ShopOffer
// ========================================

/// ShopOffer (DB row)
///
/// 追記のみ。見積もりの修正は新しい行として入る。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ShopOffer {
    pub offer_id: String,
    pub service_id: Option<String>,
    pub emergency_id: String,
    pub shop_id: String,
    pub distance_km: f64,
    pub rate_per_km: f64,
    pub distance_fee: f64,
    pub labor_cost: f64,
    pub fuel_cost: f64,
    pub total_amount: f64,
    pub note: Option<String>,
    pub created_at: i64,
}

/// オファーの紐付け先
///
/// service_id が分かる前に作られたオファーは (emergency_id, shop_id) に紐付く。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfferLink {
    LinkedToRequest { service_id: String },
    LinkedToEmergencyShop { emergency_id: String, shop_id: String },
}

impl ShopOffer {
    pub fn link(&self) -> OfferLink {
        match &self.service_id {
            Some(service_id) => OfferLink::LinkedToRequest {
                service_id: service_id.clone(),
            },
            None => OfferLink::LinkedToEmergencyShop {
                emergency_id: self.emergency_id.clone(),
                shop_id: self.shop_id.clone(),
            },
        }
    }
}

/// 見積もり入力（ServiceRequest 作成時 / オファー修正時）
#[derive(Debug, Clone, Deserialize)]
pub struct OfferInput {
    #[serde(default)]
    pub rate_per_km: f64,
    #[serde(default)]
    pub labor_cost: f64,
    #[serde(default)]
    pub fuel_cost: f64,
    pub note: Option<String>,
}

/// オファー追加リクエスト
#[derive(Debug, Deserialize)]
pub struct SubmitOfferRequest {
    pub service_id: Option<String>,
    #[serde(flatten)]
    pub offer: OfferInput,
}

/// 運転手に見せるオファー一覧の1行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferView {
    pub service_id: String,
    pub shop_id: String,
    pub shop_user_id: String,
    pub shop_name: String,
    pub shop_type: ShopType,
    pub shop_phone: Option<String>,
    pub distance_km: f64,
    pub requested_at: i64,
    pub quote: OfferQuote,
}

/// 見積もりが無い ServiceRequest も一覧から落とさない
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OfferQuote {
    Quoted {
        offer_id: String,
        link: OfferLink,
        rate_per_km: f64,
        distance_fee: f64,
        labor_cost: f64,
        fuel_cost: f64,
        total_amount: f64,
        note: Option<String>,
        created_at: i64,
    },
    NoOfferYet,
}

impl From<&ShopOffer> for OfferQuote {
    fn from(offer: &ShopOffer) -> Self {
        OfferQuote::Quoted {
            offer_id: offer.offer_id.clone(),
            link: offer.link(),
            rate_per_km: offer.rate_per_km,
            distance_fee: offer.distance_fee,
            labor_cost: offer.labor_cost,
            fuel_cost: offer.fuel_cost,
            total_amount: offer.total_amount,
            note: offer.note.clone(),
            created_at: offer.created_at,
        }
    }
}

// ========================================
// PaymentTransaction
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraItem {
    pub name: String,
    pub qty: u32,
    pub unit_cost: f64,
}

/// PaymentTransaction (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentTransaction {
    pub transaction_id: String,
    pub emergency_id: String,
    pub service_id: String,
    pub shop_id: String,
    pub driver_user_id: String,
    pub distance_fee: f64,
    pub labor_cost: f64,
    pub fuel_cost: f64,
    pub parts_cost: f64,
    pub extra_items: Json<Vec<ExtraItem>>,
    pub extra_total: f64,
    pub total_amount: f64,
    pub status: PaymentStatus,
    pub payment_method: Option<String>,
    pub proof_image_url: Option<String>,
    pub created_at: i64,
    pub paid_at: Option<i64>,
}

/// 請求内容の更新（店舗側）
#[derive(Debug, Deserialize)]
pub struct UpdateBillRequest {
    #[serde(default)]
    pub parts_cost: f64,
    #[serde(default)]
    pub extra_items: Vec<ExtraItem>,
}

/// 支払い完了（運転手側）
#[derive(Debug, Deserialize)]
pub struct MarkPaidRequest {
    pub payment_method: String,
    pub proof_image_url: Option<String>,
}

// ========================================
// Notification
// ========================================

/// Notification (DB row)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub from_user_id: Option<String>,
    pub to_user_id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub data: Json<serde_json::Value>,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

/// 通知作成リクエスト
#[derive(Debug, Clone, Deserialize)]
pub struct NewNotification {
    pub from_user_id: Option<String>,
    pub to_user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ========================================
// Acceptance
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

/// accept された店舗への通知失敗は critical、不採用店舗は non_critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Critical,
    NonCritical,
}

/// 通知の部分失敗。呼び出し側は該当 recipient だけ再送する
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialFailure {
    pub shop_id: String,
    pub recipient: String,
    pub severity: WarningSeverity,
    pub error_class: String,
    pub detail: String,
}

/// acceptOffer の結果
#[derive(Debug, Clone, Serialize)]
pub struct AcceptResult {
    pub success: bool,
    pub emergency_id: String,
    pub service_id: String,
    pub transaction_id: String,
    pub rejected_service_ids: Vec<String>,
    /// 既に accept 済みのペアに対する再実行だった
    pub replayed: bool,
    /// shop_id -> delivered | failed
    pub notifications: std::collections::BTreeMap<String, DeliveryStatus>,
    pub warnings: Vec<PartialFailure>,
}
