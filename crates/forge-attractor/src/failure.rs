use crate::NodeOutcome;

/// Closed set of failure classes. Every failed [`NodeOutcome`] is classified
/// into exactly one of these before the retry/escalation/restart gates
/// consult it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureClass {
    TransientInfra,
    Deterministic,
    Canceled,
    BudgetExhausted,
    CompilationLoop,
    Structural,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientInfra => "transient_infra",
            Self::Deterministic => "deterministic",
            Self::Canceled => "canceled",
            Self::BudgetExhausted => "budget_exhausted",
            Self::CompilationLoop => "compilation_loop",
            Self::Structural => "structural",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw.trim() {
            "transient_infra" => Some(Self::TransientInfra),
            "deterministic" => Some(Self::Deterministic),
            "canceled" => Some(Self::Canceled),
            "budget_exhausted" => Some(Self::BudgetExhausted),
            "compilation_loop" => Some(Self::CompilationLoop),
            "structural" => Some(Self::Structural),
            _ => None,
        }
    }

    /// Transient, budget-exhausted and compilation-loop failures get
    /// another attempt; deterministic, canceled and structural failures
    /// block further stage retries.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientInfra | Self::BudgetExhausted | Self::CompilationLoop
        )
    }

    /// Only budget exhaustion and compilation loops justify swapping to a
    /// fallback model/provider before retrying.
    pub fn is_escalatable(self) -> bool {
        matches!(self, Self::BudgetExhausted | Self::CompilationLoop)
    }

    /// A `loop_restart` edge is only honored for classes that can plausibly
    /// resolve on a fresh pass; structural and canceled failures must not
    /// re-enter the loop.
    pub fn allows_loop_restart(self) -> bool {
        self.is_retryable()
    }
}

/// Classifies a failed outcome. Looks first for an explicit
/// `context_updates.failure_class` hint set by the handler, then falls back
/// to scanning the failure reason for known substrings, and defaults to
/// `deterministic` when nothing else applies.
pub fn classify(outcome: &NodeOutcome) -> FailureClass {
    if let Some(explicit) = outcome
        .context_updates
        .get("failure_class")
        .and_then(|value| value.as_str())
        .and_then(FailureClass::from_str)
    {
        return explicit;
    }

    let reason = outcome.notes.clone().unwrap_or_default().to_ascii_lowercase();
    if reason.is_empty() {
        return FailureClass::Deterministic;
    }
    if contains_any(&reason, &["canceled", "cancelled"]) {
        return FailureClass::Canceled;
    }
    if contains_any(
        &reason,
        &["turn limit", "max tokens", "context window exceeded"],
    ) {
        return FailureClass::BudgetExhausted;
    }
    if contains_any(&reason, &["write_scope_violation"]) {
        return FailureClass::Structural;
    }
    if contains_any(
        &reason,
        &[
            "timeout",
            "timed out",
            "reset",
            "502",
            "503",
            "504",
            "rate limit",
        ],
    ) {
        return FailureClass::TransientInfra;
    }
    FailureClass::Deterministic
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// A canonical, prose-tolerant signature used by the cycle-breaker to detect
/// the same failure recurring across restarts: hex blobs and digit runs are
/// collapsed so that e.g. a differing commit sha or line number does not
/// defeat cycle detection, then the result is capped at 240 chars.
pub fn failure_signature(node_id: &str, class: FailureClass, reason: &str) -> String {
    let normalized = normalize_reason(reason);
    let signature = format!("{node_id}|{}|{normalized}", class.as_str());
    truncate_chars(&signature, 240)
}

fn normalize_reason(reason: &str) -> String {
    let mut out = String::new();
    let mut chars = reason.trim().to_ascii_lowercase().chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_hexdigit() {
            let mut run = String::new();
            run.push(ch);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_hexdigit() {
                    run.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if run.len() >= 6 && run.chars().any(|c| c.is_ascii_alphabetic()) {
                out.push_str("<hex>");
            } else if run.chars().all(|c| c.is_ascii_digit()) && run.len() >= 2 {
                out.push_str("<n>");
            } else {
                out.push_str(&run);
            }
            continue;
        }
        out.push(ch);
    }
    out
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect()
}
