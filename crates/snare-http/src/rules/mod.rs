//! Request rules: matchers, handlers and the ordered registry.

mod handler;
mod matcher;
mod registry;
mod string_matcher;

pub use handler::{Callback, CallbackFuture, Handler, HandlerData, PassthroughOptions, Reply};
pub use matcher::{json_includes, CompiledMatcher, Matcher};
pub use registry::{MatchedRule, RuleData, RuleDefinition, RuleHandle, RuleRegistry};
pub use string_matcher::{CompiledStringMatcher, StringMatcher};
