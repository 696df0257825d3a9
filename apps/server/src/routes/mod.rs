use actix_web::web;

mod health;
mod subscriptions;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health::health_route)
        .service(subscriptions::subscribe)
        .service(subscriptions::unsubscribe)
        .service(subscriptions::preferences)
        .service(subscriptions::confirm);
}
