pub mod messages;
pub mod wsroute;

use actix_web::web;

/// Register every client-facing route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(messages::send_message)
        .service(messages::get_message)
        .service(messages::revoke_message)
        .service(messages::delete_message)
        .service(messages::get_history)
        .service(messages::update_read)
        .service(messages::update_settings)
        .service(messages::get_unread)
        .service(messages::recent_conversations)
        .service(messages::sync_messages)
        .service(wsroute::ws_handler);
}
