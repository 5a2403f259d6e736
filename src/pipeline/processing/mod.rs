// Stage engines, in pipeline order

pub mod normalize;
pub mod validate;

pub mod dedupe;

pub mod dimension;
pub mod fact;

pub mod quality;
