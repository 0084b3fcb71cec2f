//! Wire protocols: STUN message codec and the TURN relay built on it

pub mod stun;
pub mod turn;
