mod elector;
mod voter;

pub use elector::Elector;
pub(crate) use elector::ElectionHost;
pub(crate) use voter::Voter;

#[derive(Debug, Clone, PartialEq)]
pub enum ElectionState {
    NoMaster,
    Leading,
    Following,
}
