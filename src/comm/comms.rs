//! Local comm state and outgoing sends.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::error::CallError;
use super::lane::LaneHandle;
use super::protocol::{encode_frame, CommId, Frame, FrameBody};

/// One comm or every open comm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommTarget {
    One(CommId),
    All,
}

impl From<CommId> for CommTarget {
    fn from(id: CommId) -> Self {
        CommTarget::One(id)
    }
}

impl From<Option<CommId>> for CommTarget {
    fn from(id: Option<CommId>) -> Self {
        id.map_or(CommTarget::All, CommTarget::One)
    }
}

struct Comm {
    /// Lane outgoing frames currently go out on.
    send_lane: LaneHandle,
    protocol_version: u32,
}

/// Every comm on this endpoint, plus the port stamped on outgoing calls.
pub struct CommTable {
    comms: Mutex<HashMap<CommId, Comm>>,
    advertised_port: Mutex<Option<u16>>,
}

impl CommTable {
    pub fn new() -> Self {
        Self {
            comms: Mutex::new(HashMap::new()),
            advertised_port: Mutex::new(None),
        }
    }

    pub fn insert(&self, id: CommId, lane: LaneHandle, protocol_version: u32) {
        self.comms.lock().insert(
            id,
            Comm {
                send_lane: lane,
                protocol_version,
            },
        );
    }

    /// Ids matching `target`. Unknown single ids are an error.
    pub fn ids(&self, target: CommTarget) -> Result<Vec<CommId>, CallError> {
        let comms = self.comms.lock();
        match target {
            CommTarget::One(id) if comms.contains_key(&id) => Ok(vec![id]),
            CommTarget::One(id) => Err(CallError::UnknownComm(id)),
            CommTarget::All => {
                let mut ids: Vec<CommId> = comms.keys().copied().collect();
                ids.sort();
                Ok(ids)
            }
        }
    }

    /// Remove comms matching `target`, returning the removed ids.
    pub fn remove(&self, target: CommTarget) -> Vec<CommId> {
        let mut comms = self.comms.lock();
        match target {
            CommTarget::One(id) => comms.remove(&id).map(|_| vec![id]).unwrap_or_default(),
            CommTarget::All => comms.drain().map(|(id, _)| id).collect(),
        }
    }

    pub fn clear(&self) {
        self.comms.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.comms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn protocol_version(&self, id: &CommId) -> Option<u32> {
        self.comms.lock().get(id).map(|comm| comm.protocol_version)
    }

    /// Point the outgoing lane of `id` at `lane`.
    pub fn bind_lane(&self, id: &CommId, lane: LaneHandle) {
        if let Some(comm) = self.comms.lock().get_mut(id) {
            comm.send_lane = lane;
        }
    }

    pub fn lane_of(&self, id: &CommId) -> Option<LaneHandle> {
        self.comms.lock().get(id).map(|comm| comm.send_lane.clone())
    }

    pub fn set_advertised_port(&self, port: Option<u16>) {
        *self.advertised_port.lock() = port;
    }

    pub fn advertised_port(&self) -> Option<u16> {
        *self.advertised_port.lock()
    }

    /// Send `body` to every comm in `target` on its currently bound lane.
    ///
    /// Calls are stamped with this side's advertised priority port.
    pub fn send(&self, target: CommTarget, mut body: FrameBody) -> Result<(), CallError> {
        if let FrameBody::RemoteCall(request) = &mut body {
            request.priority_port = self.advertised_port();
        }

        let ids = self.ids(target)?;
        if ids.is_empty() {
            return Err(CallError::NotOpen);
        }
        for id in ids {
            let lane = self.lane_of(&id).ok_or(CallError::UnknownComm(id))?;
            let bytes = encode_frame(&Frame::new(id, body.clone()))?;
            lane.send(bytes)?;
        }
        Ok(())
    }

    /// Send `body` for `id` on an explicit lane, bypassing the binding.
    pub fn send_on(&self, lane: &LaneHandle, id: CommId, body: FrameBody) -> Result<(), CallError> {
        let bytes = encode_frame(&Frame::new(id, body))?;
        lane.send(bytes)?;
        Ok(())
    }
}

impl Default for CommTable {
    fn default() -> Self {
        Self::new()
    }
}
