// FerroDB
// Copyright (C) 2025 FerroDB Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Ambient log-context propagation between submitter and worker.
//!
//! The tracing span that is current on the submitting thread is captured into
//! every work item and re-entered on the worker for the duration of the
//! invocation, so log lines emitted by the payload carry the fields of the
//! request that scheduled it. The span guard restores the previous context on
//! every exit path, including unwinding.

use tracing::Span;

/// Snapshot of the submitting thread's tracing context.
#[derive(Debug, Clone)]
pub struct CapturedContext {
    span: Span,
}

impl CapturedContext {
    /// Capture the context that is current right now.
    pub fn capture() -> Self {
        Self {
            span: Span::current(),
        }
    }

    /// Run `f` with the captured context installed.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _entered = self.span.enter();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_scope_roundtrip() {
        let span = tracing::info_span!("request", id = 42);
        let context = {
            let _entered = span.enter();
            CapturedContext::capture()
        };
        // outside the span now; scope() must reinstall it
        let inside = context.scope(|| Span::current().id());
        assert_eq!(inside, span.id());
    }

    #[test]
    fn test_scope_restores_on_panic() {
        let span = tracing::info_span!("doomed");
        let context = {
            let _entered = span.enter();
            CapturedContext::capture()
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            context.scope(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(Span::current().id(), None);
    }
}
