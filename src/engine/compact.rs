use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the journal as the minimal event set that rebuilds current
    /// state. Mutations are held off for the duration, so no record appended
    /// during the snapshot can be lost.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .store
            .blocked_dates()
            .into_iter()
            .map(|blocked| Event::DateBlocked { blocked })
            .collect();
        for requester in self.requesters() {
            events.push(Event::RequesterRegistered { requester });
        }
        for (_, ds) in self.store.devices_sorted() {
            let guard = ds.read().await;
            events.push(Event::DeviceRegistered {
                device: guard.device.clone(),
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
            for incident in &guard.incidents {
                events.push(Event::IncidentReported {
                    incident: incident.clone(),
                    device_status: None,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("journal compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
