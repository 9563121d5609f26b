use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// Play state shared by both sides of a session. Ordering follows the
/// numeric value, so `KillClients < NoGameState < Menu < ... < WinGame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GameStatus {
    KillClients,
    NoGameState,
    #[default]
    Menu,
    Initializing,
    Loading,
    FinishLoading,
    ClientLoadingServerObjects,
    ClientLoadingReplicatedNodes,
    Synchronizing,
    Ready,
    StartGame,
    Running,
    EndGame,
    WinGame,
}

impl GameStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            GameStatus::KillClients => -2,
            GameStatus::NoGameState => -1,
            GameStatus::Menu => 0,
            GameStatus::Initializing => 1,
            GameStatus::Loading => 2,
            GameStatus::FinishLoading => 3,
            GameStatus::ClientLoadingServerObjects => 4,
            GameStatus::ClientLoadingReplicatedNodes => 5,
            GameStatus::Synchronizing => 6,
            GameStatus::Ready => 7,
            GameStatus::StartGame => 8,
            GameStatus::Running => 9,
            GameStatus::EndGame => 10,
            GameStatus::WinGame => 11,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, WireError> {
        Ok(match value {
            -2 => GameStatus::KillClients,
            -1 => GameStatus::NoGameState,
            0 => GameStatus::Menu,
            1 => GameStatus::Initializing,
            2 => GameStatus::Loading,
            3 => GameStatus::FinishLoading,
            4 => GameStatus::ClientLoadingServerObjects,
            5 => GameStatus::ClientLoadingReplicatedNodes,
            6 => GameStatus::Synchronizing,
            7 => GameStatus::Ready,
            8 => GameStatus::StartGame,
            9 => GameStatus::Running,
            10 => GameStatus::EndGame,
            11 => GameStatus::WinGame,
            other => return Err(WireError::UnknownStatus(other)),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::KillClients => "KillClients",
            GameStatus::NoGameState => "NoGameState",
            GameStatus::Menu => "Menu",
            GameStatus::Initializing => "Initializing",
            GameStatus::Loading => "Loading",
            GameStatus::FinishLoading => "FinishLoading",
            GameStatus::ClientLoadingServerObjects => "ClientLoadingServerObjects",
            GameStatus::ClientLoadingReplicatedNodes => "ClientLoadingReplicatedNodes",
            GameStatus::Synchronizing => "Synchronizing",
            GameStatus::Ready => "Ready",
            GameStatus::StartGame => "StartGame",
            GameStatus::Running => "Running",
            GameStatus::EndGame => "EndGame",
            GameStatus::WinGame => "WinGame",
        }
    }

    /// Window in which a client asks for its avatars.
    pub fn is_loading_window(self) -> bool {
        self >= GameStatus::ClientLoadingServerObjects && self <= GameStatus::Synchronizing
    }
}

impl PartialOrd for GameStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GameStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_i32().cmp(&other.as_i32())
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
