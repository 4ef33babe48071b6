//! Box selection
//!
//! `choose` walks the candidate list of an application alias and keeps the
//! eligible box with the lowest score. The first candidate is the fallback:
//! it is returned when nothing better survives the filters.
//!
//! Filters applied to each remaining candidate, in order: health (`on`, HTTP
//! capable, scored), client geo, local tests, bandwidth ceiling, linear
//! shedding between `floorbw` and `ceilbw`, global and per-box DNS throttles.

use rand::Rng;
use std::sync::Arc;
use tracing::info;

use crate::box_state::{BoxState, BoxStateModel, HealthStatus};
use crate::config::{AppCandidate, BoxConfig};
use crate::geo::GeoInfo;

fn is_all(list: &[String]) -> bool {
    list.iter().any(|c| c == "ALL")
}

/// Geo allow-list check; an unknown location always passes.
pub fn geo_allowed(candidate: &AppCandidate, config: &BoxConfig, geo: Option<&GeoInfo>) -> bool {
    let countries = candidate.countries.as_ref().or(config.countries.as_ref());
    let continents = candidate.continents.as_ref().or(config.continents.as_ref());
    let country = geo.and_then(|g| g.country.as_deref());
    let continent = geo.and_then(|g| g.continent.as_deref());

    let continent_listed = |code: &str| continents.map_or(true, |list| list.iter().any(|c| c == code));

    match countries {
        // continent-only rule
        Some(_) if candidate.continents.is_some() && candidate.countries.is_none() => {
            continent.map_or(true, continent_listed)
        }
        None => continent.map_or(true, continent_listed),
        Some(countries) if is_all(countries) => true,
        Some(countries) => match country {
            None => true,
            Some(code) if countries.iter().any(|c| c == code) => true,
            Some(_) => match continents {
                None => false,
                Some(_) => continent.map_or(true, continent_listed),
            },
        },
    }
}

fn seed_score(candidate: &AppCandidate, state: &BoxState) -> Option<f64> {
    if let Some(add) = candidate.addscore {
        return state.gettime.map(|t| t + add);
    }
    candidate.fixscore.or(state.score)
}

fn candidate_score(candidate: &AppCandidate, state: &BoxState) -> Option<f64> {
    if let Some(add) = candidate.addscore {
        return state.gettime.map(|t| t + add).or(state.score);
    }
    candidate.fixscore.or(state.score)
}

fn local_tests_pass(candidate: &AppCandidate, state: &BoxState) -> bool {
    match &candidate.localtests {
        Some(tests) => tests
            .iter()
            .all(|t| state.localtests.get(t).copied().unwrap_or(false)),
        None => true,
    }
}

/// Bandwidth and DNS-rate admission of one candidate.
fn admitted<R: Rng + ?Sized>(model: &BoxStateModel, state: &BoxState, qname: &str, rng: &mut R) -> bool {
    let Some(bw) = state.bw else {
        return true;
    };
    let cfg = &state.config;

    if let Some(ceil) = cfg.ceilbw {
        if bw > ceil {
            info!(target: "limit", cause = "Limitation BP max", ceilbw = ceil, cdnbox = %cfg.name, qname, "excluded");
            return false;
        }
        if let Some(floor) = cfg.floorbw {
            if bw > floor {
                let delta = bw - floor;
                if rng.gen::<f64>() * (ceil - floor) < delta {
                    info!(target: "limit", cause = "Limitation BP delta", delta, cdnbox = %cfg.name, qname, "excluded");
                    return false;
                }
            }
        }
    }

    let globalthrottlebwratio = model.config().dnsserver.globalthrottlebwratio;
    let ratio = match cfg.targetbw {
        Some(target) => {
            if bw > target * globalthrottlebwratio && model.dns_global_req_throttle(state) {
                return false;
            }
            if bw > cfg.dnsthrottlebwratio * target {
                cfg.dnsthrottlehighratio
            } else {
                cfg.dnsthrottlelowratio
            }
        }
        None => cfg.dnsthrottlelowratio,
    };
    !state.dns_req_throttle(ratio)
}

/// Pick the box answering `app_key`; `None` for an unknown application.
///
/// Side effects: per-app and per-(app, box) statistics and the chosen box's
/// request counters.
pub fn choose<R: Rng + ?Sized>(
    model: &mut BoxStateModel,
    qname: &str,
    geo: Option<&GeoInfo>,
    app_key: &str,
    rng: &mut R,
) -> Option<String> {
    let config = Arc::clone(model.config());
    let candidates = config.app(app_key)?;
    let (first, rest) = candidates.split_first()?;
    let first_state = model.get(&first.cdnbox)?;

    let mut chosen = first.cdnbox.as_str();
    let mut status = first_state.status;
    let mut best = seed_score(first, first_state);

    for candidate in rest {
        let Some(state) = model.get(&candidate.cdnbox) else {
            continue;
        };
        let healthy = state.is_on() && state.config.ishttp;

        // a healthy box always beats a failed provisional winner
        if healthy && status != HealthStatus::On {
            chosen = candidate.cdnbox.as_str();
            status = state.status;
            best = state.score;
        }

        if !healthy || state.score.is_none() {
            continue;
        }
        if !geo_allowed(candidate, &state.config, geo) {
            continue;
        }
        if !local_tests_pass(candidate, state) {
            continue;
        }
        if !admitted(model, state, qname, rng) {
            continue;
        }

        if let Some(score) = candidate_score(candidate, state) {
            if score < best.unwrap_or(f64::INFINITY) {
                chosen = candidate.cdnbox.as_str();
                best = Some(score);
            }
        }
    }

    let chosen = chosen.to_string();
    model.count_app(app_key, Some(&chosen));
    model.count_request(&chosen);
    Some(chosen)
}
