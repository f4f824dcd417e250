use crate::peer::types::IceCandidate;
use std::sync::Once;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Локальное время в каждой строке лога
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.format(TIMESTAMP_FORMAT))
    }
}

/// Логирование с временными метками
///
/// Ставит глобальный `tracing` subscriber. Фильтр берётся из `RUST_LOG`,
/// иначе используется `config::dev::DEFAULT_FILTER`.
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(crate::config::dev::DEFAULT_FILTER));
        // try_init: subscriber мог уже поставить кто-то другой (например, тесты)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(LocalTime)
            .with_target(true)
            .try_init();
    });
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    tracing::debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}

/// Краткая сводка по типам кандидатов
pub fn analyze_candidates<'a>(candidates: impl IntoIterator<Item = &'a IceCandidate>) {
    let (mut host, mut srflx, mut relay) = (0, 0, 0);
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay += 1;
        }
    }
    tracing::debug!("Candidate analysis: {host} host, {srflx} srflx, {relay} relay");
}
