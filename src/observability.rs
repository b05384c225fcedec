use biometrics::{Collector, Counter, Moments};

pub(crate) static STORE_LOADS: Counter = Counter::new("confab.store.loads");
pub(crate) static STORE_SAVES: Counter = Counter::new("confab.store.saves");
pub(crate) static STORE_SAVE_ERRORS: Counter = Counter::new("confab.store.save_errors");
pub(crate) static STORE_MIGRATIONS: Counter = Counter::new("confab.store.migrations");

pub(crate) static STREAM_DELTAS: Counter = Counter::new("confab.stream.deltas");
pub(crate) static STREAM_EMPTY: Counter = Counter::new("confab.stream.empty");

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("confab.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("confab.client.request_errors");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("confab.client.request_duration_seconds");

pub(crate) static EXCHANGES: Counter = Counter::new("confab.conversation.exchanges");
pub(crate) static EXCHANGE_ERRORS: Counter = Counter::new("confab.conversation.exchange_errors");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&STORE_LOADS);
    collector.register_counter(&STORE_SAVES);
    collector.register_counter(&STORE_SAVE_ERRORS);
    collector.register_counter(&STORE_MIGRATIONS);

    collector.register_counter(&STREAM_DELTAS);
    collector.register_counter(&STREAM_EMPTY);

    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_moments(&CLIENT_REQUEST_DURATION);

    collector.register_counter(&EXCHANGES);
    collector.register_counter(&EXCHANGE_ERRORS);
}
