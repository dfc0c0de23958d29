mod aggregation;
mod cost;
mod edge;
mod node;
mod run;
mod usage;

pub use self::{aggregation::*, cost::*, edge::*, node::*, run::*, usage::*};
