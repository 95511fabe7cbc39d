//! Reusable oracles.

use cairn_core::LocalViewStatus;

use super::OracleFn;

/// Every client holds an active group on every stream.
pub fn all_active() -> OracleFn {
    Box::new(|report| {
        for stream_id in report.stream_ids() {
            for (client, view) in report.per_client(&stream_id) {
                if view.status != Some(LocalViewStatus::Active) {
                    return Err(format!(
                        "client {client} on stream {stream_id} is {:?}, expected Active",
                        view.status
                    ));
                }
            }
        }
        Ok(())
    })
}

/// Every client derived the same Remote View for each stream.
pub fn remote_views_converged() -> OracleFn {
    Box::new(|report| {
        for stream_id in report.stream_ids() {
            let mut views = report.per_client(&stream_id);
            let Some((first_client, first)) = views.next() else {
                continue;
            };
            for (client, view) in views {
                if view.digest != first.digest {
                    return Err(format!(
                        "remote views diverged on stream {stream_id}: {first_client} vs {client}"
                    ));
                }
            }
        }
        Ok(())
    })
}

/// Every client's group is at `epoch` on every stream.
pub fn all_at_epoch(epoch: u64) -> OracleFn {
    Box::new(move |report| {
        for stream_id in report.stream_ids() {
            for (client, view) in report.per_client(&stream_id) {
                if view.epoch != Some(epoch) || view.remote_epoch() != Some(epoch) {
                    return Err(format!(
                        "client {client} on stream {stream_id}: local {:?}, remote {:?}, expected {epoch}",
                        view.epoch,
                        view.remote_epoch()
                    ));
                }
            }
        }
        Ok(())
    })
}

/// Run every oracle, failing on the first error.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |report| oracles.iter().try_for_each(|oracle| oracle(report)))
}
