use crate::flush::{FlushReport, ProcessedBroadcast};
use crate::history::{BroadcastSummary, HistoryPage};
use crate::models::{
    Broadcast, EmailDeliveryState, EmailStatus, Message, NewMessage, NewUser, Priority,
    RecipientFilter, Scope, SearchField, User, UserStatus,
};
use crate::routes::{
    FlushRequest, FlushResponse, HistoryResponse, SendBroadcastRequest, SendBroadcastResponse,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::send_broadcast,
        crate::routes::flush_broadcasts,
        crate::routes::broadcast_history,
    ),
    components(schemas(
        Priority, Scope, UserStatus, SearchField, RecipientFilter,
        User, NewUser, Message, NewMessage,
        EmailStatus, EmailDeliveryState, Broadcast,
        SendBroadcastRequest, SendBroadcastResponse,
        FlushRequest, FlushResponse, ProcessedBroadcast, FlushReport,
        HistoryResponse, BroadcastSummary, HistoryPage
    )),
    tags(
        (name = "broadcast", description = "Admin broadcast operations")
    )
)]
pub struct ApiDoc;
