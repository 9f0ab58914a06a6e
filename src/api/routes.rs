//! Route Definitions
//!
//! Maps URLs to handlers with type-safe routing.

use super::{handlers::*, middleware::admin_key_middleware};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    // Oracle, game-result intake, money-in and lottery control sit behind the admin key
    let admin = Router::new()
        .route("/prices", post(push_price_handler))
        .route("/rooms/:room_id/result", post(room_result_handler))
        .route("/deposits/:deposit_id/confirm", post(confirm_deposit_handler))
        .route("/lottery/open", post(open_lottery_handler))
        .route("/lottery/end", post(lottery_end_handler))
        .route("/lottery/close", post(close_lottery_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_key_middleware));

    Router::new()
        .route("/health", get(health_handler))
        // Accounts
        .route("/accounts", post(open_account_handler))
        .route("/balance", get(balance_handler))
        .route("/balance/history", get(history_handler))
        .route("/balance/deposit", post(deposit_handler))
        .route("/balance/deposits", get(list_deposits_handler))
        .route("/balance/withdraw", post(withdraw_handler))
        // Prediction bets
        .route("/wagers", post(place_wager_handler).get(list_wagers_handler))
        .route("/wagers/check", post(check_handler))
        .route("/wagers/:wager_id", get(wager_detail_handler))
        // Rooms
        .route("/rooms", post(create_room_handler).get(list_rooms_handler))
        .route("/rooms/:room_id", get(room_detail_handler))
        .route("/rooms/:room_id/join", post(join_room_handler))
        .route("/rooms/:room_id/leave", post(leave_room_handler))
        .route("/rooms/:room_id/cancel", post(cancel_room_handler))
        // Referrals
        .route("/referrals", get(referral_summary_handler).post(register_referral_handler))
        .route("/referrals/claim", post(claim_referral_handler))
        // Lottery
        .route("/lottery", get(lottery_handler))
        .route("/lottery/top", get(lottery_top_handler))
        .route("/lottery/entries", post(enter_lottery_handler))
        // Metrics endpoint for Prometheus
        .route("/metrics", get(metrics_handler))
        .merge(admin)
        .with_state(state)
}
