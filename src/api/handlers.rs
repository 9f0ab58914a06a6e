//! Request Handlers
//!
//! Thin adapters from HTTP to the session coordinator. Every mutating call
//! names its account through the `x-account-id` header.

use super::{
    errors::ApiError,
    middleware::{caller_account, RequestId},
    models::*,
};
use crate::{
    common::traits::Clock,
    coordinator::SessionCoordinator,
    errors::EngineError,
    lottery::LotteryClose,
    price_feed::PriceBook,
    rooms::CreateRoom,
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub prices: Arc<PriceBook>,
    pub clock: Arc<dyn Clock>,
    pub admin_api_key: Option<String>,
    pub version: String,
}

fn engine_error(request_id: &RequestId) -> impl Fn(EngineError) -> ApiError + '_ {
    move |e| ApiError::engine(request_id.0.clone(), e)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>, request_id: &RequestId) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::bad_request(request_id.0.clone(), e.body_text()))
}

fn page_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// POST /accounts
///
/// Opens with a zero balance. A named referrer must already exist.
pub async fn open_account_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OpenAccountRequest>, JsonRejection>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let req = json_body(payload, &request_id)?;
    if let Some(referrer) = &req.referrer {
        if referrer == &req.account_id {
            return Err(ApiError::bad_request(
                request_id.0.clone(),
                "an account cannot refer itself".to_string(),
            ));
        }
        state
            .coordinator
            .balance(referrer)
            .await
            .map_err(engine_error(&request_id))?;
    }

    let account = state
        .coordinator
        .open_account(&req.account_id, 0)
        .await
        .map_err(engine_error(&request_id))?;
    if let Some(referrer) = &req.referrer {
        state
            .coordinator
            .register_referral(&req.account_id, referrer)
            .await
            .map_err(engine_error(&request_id))?;
    }
    Ok(Json(account.into()))
}

/// GET /balance
pub async fn balance_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let account = state
        .coordinator
        .balance(&account_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(account.into()))
}

/// GET /balance/history?cursor={hex}&limit={n}
pub async fn history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let page = state
        .coordinator
        .history(&account_id, query.cursor.as_deref(), page_limit(query.limit))
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(HistoryResponse {
        ok: true,
        entries: page.items,
        next_cursor: page.next_cursor,
    }))
}

/// POST /balance/deposit
///
/// Records a pending deposit; the balance moves on operator confirmation.
pub async fn deposit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Json<DepositResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let req = json_body(payload, &request_id)?;
    let deposit = state
        .coordinator
        .request_deposit(&account_id, req.amount)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(DepositResponse { ok: true, deposit }))
}

/// GET /balance/deposits?cursor={hex}&limit={n}
pub async fn list_deposits_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<DepositListResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let page = state
        .coordinator
        .deposits_for(&account_id, query.cursor.as_deref(), page_limit(query.limit))
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(DepositListResponse {
        ok: true,
        deposits: page.items,
        next_cursor: page.next_cursor,
    }))
}

/// POST /deposits/:deposit_id/confirm (admin)
pub async fn confirm_deposit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(deposit_id): Path<String>,
) -> Result<Json<DepositResponse>, ApiError> {
    let deposit = state
        .coordinator
        .confirm_deposit(&deposit_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(DepositResponse { ok: true, deposit }))
}

/// POST /balance/withdraw
pub async fn withdraw_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let req = json_body(payload, &request_id)?;
    let account = state
        .coordinator
        .withdraw(&account_id, req.amount)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(account.into()))
}

/// POST /wagers/check
pub async fn check_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Json<CheckResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let req = json_body(payload, &request_id)?;
    let check = state
        .coordinator
        .check(&account_id, req.amount)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(CheckResponse {
        ok: check.ok,
        available: check.available,
    }))
}

/// POST /wagers
pub async fn place_wager_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<PlaceWagerRequest>, JsonRejection>,
) -> Result<Json<PlaceWagerResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let req = json_body(payload, &request_id)?;
    let wager = state
        .coordinator
        .place_prediction(&account_id, req.amount, &req.coin, req.horizon_hours, req.direction)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(PlaceWagerResponse {
        ok: true,
        wager_id: wager.id,
        entry_price: wager.entry_price,
        deadline: wager.deadline,
    }))
}

/// GET /wagers?cursor={hex}&limit={n}
pub async fn list_wagers_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<WagerListResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let page = state
        .coordinator
        .wagers_for(&account_id, query.cursor.as_deref(), page_limit(query.limit))
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(WagerListResponse {
        ok: true,
        wagers: page.items,
        next_cursor: page.next_cursor,
    }))
}

/// GET /wagers/:wager_id
pub async fn wager_detail_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(wager_id): Path<String>,
) -> Result<Json<WagerResponse>, ApiError> {
    let wager = state
        .coordinator
        .wager(&wager_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(WagerResponse { ok: true, wager }))
}

/// POST /rooms
pub async fn create_room_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> Result<Json<RoomTicket>, ApiError> {
    let host_id = caller_account(&headers, &request_id)?;
    let req = json_body(payload, &request_id)?;
    let room = state
        .coordinator
        .create_room(&CreateRoom {
            host_id,
            name: req.name,
            reward: req.reward,
            kind: req.kind,
            capacity: req.capacity,
        })
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(RoomTicket::from(&room)))
}

/// GET /rooms?kind={dice|blackjack}&cursor={hex}&limit={n}
pub async fn list_rooms_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomListQuery>,
) -> Result<Json<RoomListResponse>, ApiError> {
    let page = state
        .coordinator
        .list_rooms(query.kind, query.cursor.as_deref(), page_limit(query.limit))
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(RoomListResponse {
        ok: true,
        rooms: page.items.iter().map(RoomSummary::from).collect(),
        next_cursor: page.next_cursor,
    }))
}

/// GET /rooms/:room_id
pub async fn room_detail_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomDetailResponse>, ApiError> {
    let room = state
        .coordinator
        .room(&room_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(room.into()))
}

/// POST /rooms/:room_id/join
pub async fn join_room_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomTicket>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let room = state
        .coordinator
        .join_room(&room_id, &account_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(RoomTicket::from(&room)))
}

/// POST /rooms/:room_id/leave
pub async fn leave_room_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomTicket>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let room = state
        .coordinator
        .leave_room(&room_id, &account_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(RoomTicket::from(&room)))
}

/// POST /rooms/:room_id/cancel
pub async fn cancel_room_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomTicket>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let room = state
        .coordinator
        .cancel_room(&room_id, Some(&account_id))
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(RoomTicket::from(&room)))
}

/// POST /rooms/:room_id/result (admin)
pub async fn room_result_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    payload: Result<Json<RoomResultRequest>, JsonRejection>,
) -> Result<Json<RoomDetailResponse>, ApiError> {
    let req = json_body(payload, &request_id)?;
    let room = state
        .coordinator
        .record_room_result(&room_id, req.outcome)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(room.into()))
}

/// POST /prices (admin)
pub async fn push_price_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PricePushRequest>, JsonRejection>,
) -> Result<Json<PricePushResponse>, ApiError> {
    let req = json_body(payload, &request_id)?;
    let at = req.at.unwrap_or_else(|| state.clock.now());
    let sample = state
        .prices
        .push(&req.coin, req.price, at)
        .map_err(engine_error(&request_id))?;
    Ok(Json(PricePushResponse {
        ok: true,
        coin: sample.coin,
        price: sample.price,
        at: sample.at,
    }))
}

/// GET /referrals
pub async fn referral_summary_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ReferralSummaryResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let (rewards, link) = state
        .coordinator
        .referral_rewards(&account_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(ReferralSummaryResponse::new(rewards, link)))
}

/// POST /referrals
pub async fn register_referral_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ReferralRequest>, JsonRejection>,
) -> Result<Json<ReferralSummaryResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let req = json_body(payload, &request_id)?;
    state
        .coordinator
        .register_referral(&account_id, &req.referrer)
        .await
        .map_err(engine_error(&request_id))?;
    let (rewards, link) = state
        .coordinator
        .referral_rewards(&account_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(ReferralSummaryResponse::new(rewards, link)))
}

/// POST /referrals/claim
pub async fn claim_referral_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ReferralClaimResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let claim = state
        .coordinator
        .claim_referral_reward(&account_id)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(ReferralClaimResponse {
        ok: true,
        claimed: claim.claimed,
        balance: claim.account.balance,
    }))
}

/// GET /lottery
pub async fn lottery_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<LotteryResponse>, ApiError> {
    let round = state
        .coordinator
        .lottery_round()
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(LotteryResponse { ok: true, round }))
}

/// GET /lottery/top?limit={n}
pub async fn lottery_top_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LotteryTopQuery>,
) -> Result<Json<LotteryTopResponse>, ApiError> {
    let (round, entries) = state
        .coordinator
        .lottery_top(query.limit.map(page_limit))
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(LotteryTopResponse {
        ok: true,
        round_id: round.id,
        pot: round.pot,
        entries,
    }))
}

/// POST /lottery/entries
pub async fn enter_lottery_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Json<LotteryEntryResponse>, ApiError> {
    let account_id = caller_account(&headers, &request_id)?;
    let req = json_body(payload, &request_id)?;
    let (entry, round) = state
        .coordinator
        .enter_lottery(&account_id, req.amount)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(LotteryEntryResponse {
        ok: true,
        entry,
        pot: round.pot,
    }))
}

/// POST /lottery/open (admin)
pub async fn open_lottery_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LotteryScheduleRequest>, JsonRejection>,
) -> Result<Json<LotteryResponse>, ApiError> {
    let req = json_body(payload, &request_id)?;
    let round = state
        .coordinator
        .open_lottery(req.ends_at)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(LotteryResponse { ok: true, round }))
}

/// POST /lottery/end (admin)
pub async fn lottery_end_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LotteryScheduleRequest>, JsonRejection>,
) -> Result<Json<LotteryResponse>, ApiError> {
    let req = json_body(payload, &request_id)?;
    let round = state
        .coordinator
        .change_lottery_end(req.ends_at)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(LotteryResponse { ok: true, round }))
}

/// POST /lottery/close (admin)
pub async fn close_lottery_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LotteryClose>, JsonRejection>,
) -> Result<Json<LotteryResponse>, ApiError> {
    let how = json_body(payload, &request_id)?;
    let round = state
        .coordinator
        .close_lottery(how)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(LotteryResponse { ok: true, round }))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.coordinator.metrics().render(),
    )
}
