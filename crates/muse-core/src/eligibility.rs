//! Pre-flight eligibility gate.
//!
//! Runs before any token or provider work. Rules are evaluated in order and
//! the first match wins:
//!
//! 1. admins are always allowed, at zero cost;
//! 2. flagged prompts need premium;
//! 3. multi-image batches need premium;
//! 4. free users are capped per week;
//! 5. everyone else is allowed at the quoted cost.

use serde::{Deserialize, Serialize};

use crate::pricing::{quote_cost, PricingConfig};
use crate::{Caller, GenerationRequest};

/// Images a free user may generate per week.
pub const DEFAULT_FREE_WEEKLY_IMAGE_LIMIT: u32 = 10;

/// Free-tier limits and content policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityPolicy {
    /// Images a free user may generate per week.
    pub free_weekly_image_limit: u32,

    /// Prompt classifier for the free-tier content gate.
    pub classifier: ContentClassifier,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            free_weekly_image_limit: DEFAULT_FREE_WEEKLY_IMAGE_LIMIT,
            classifier: ContentClassifier::default(),
        }
    }
}

/// Keyword-based prompt classifier.
///
/// Matches whole words case-insensitively; a keyword containing spaces must
/// appear as the same word sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentClassifier {
    /// Lowercase keywords that flag a prompt.
    pub keywords: Vec<String>,
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new([
            "nsfw", "nude", "nudity", "naked", "topless", "explicit", "porn", "sex", "sexy",
            "lingerie", "erotic", "hentai", "uncensored",
        ])
    }
}

impl ContentClassifier {
    /// Build a classifier from keywords.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Whether `prompt` contains a flagged keyword.
    #[must_use]
    pub fn is_flagged(&self, prompt: &str) -> bool {
        let words: Vec<String> = prompt
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        self.keywords.iter().any(|keyword| {
            let needle: Vec<&str> = keyword.split_whitespace().collect();
            !needle.is_empty()
                && words
                    .windows(needle.len())
                    .any(|window| window.iter().zip(&needle).all(|(w, n)| w == n))
        })
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Prompt flagged by the classifier.
    NsfwRequiresUpgrade,
    /// More than one image requested.
    MultiImageRequiresUpgrade,
    /// Weekly free allotment used up.
    WeeklyFreeLimitReached,
}

impl DenialReason {
    /// Message shown to the user.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NsfwRequiresUpgrade => "NSFW content requires upgrade.",
            Self::MultiImageRequiresUpgrade => "multi-image generation requires upgrade.",
            Self::WeeklyFreeLimitReached => "weekly free limit reached.",
        }
    }
}

/// Outcome of the gate. Computed per request, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EligibilityDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Why it may not.
    pub reason: Option<DenialReason>,
    /// Whether upgrading the plan would lift the refusal.
    pub upgrade_required: bool,
    /// Tokens the request will cost if allowed.
    pub token_cost: i64,
}

impl EligibilityDecision {
    const fn allow(token_cost: i64) -> Self {
        Self {
            allowed: true,
            reason: None,
            upgrade_required: false,
            token_cost,
        }
    }

    const fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            upgrade_required: true,
            token_cost: 0,
        }
    }
}

/// Decide whether `caller` may run `request`.
///
/// `images_this_week` is the caller's usage counter for the current week.
#[must_use]
pub fn check_eligibility(
    caller: &Caller,
    request: &GenerationRequest,
    images_this_week: u32,
    policy: &EligibilityPolicy,
    pricing: &PricingConfig,
) -> EligibilityDecision {
    if caller.is_admin {
        return EligibilityDecision::allow(0);
    }

    let restricted = caller.tier().is_restricted();

    if restricted && policy.classifier.is_flagged(&request.prompt) {
        return EligibilityDecision::deny(DenialReason::NsfwRequiresUpgrade);
    }

    if restricted && request.image_count > 1 {
        return EligibilityDecision::deny(DenialReason::MultiImageRequiresUpgrade);
    }

    if restricted && images_this_week >= policy.free_weekly_image_limit {
        return EligibilityDecision::deny(DenialReason::WeeklyFreeLimitReached);
    }

    EligibilityDecision::allow(quote_cost(
        caller,
        &request.model,
        request.image_count,
        pricing,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;

    fn decide(caller: &Caller, request: &GenerationRequest, used: u32) -> EligibilityDecision {
        check_eligibility(
            caller,
            request,
            used,
            &EligibilityPolicy::default(),
            &PricingConfig::default(),
        )
    }

    #[test]
    fn free_single_clean_image_is_free() {
        let decision = decide(
            &Caller::free(UserId::generate()),
            &GenerationRequest::new("a watercolor harbor"),
            0,
        );
        assert!(decision.allowed);
        assert_eq!(decision.token_cost, 0);
    }

    #[test]
    fn free_multi_image_needs_upgrade() {
        let decision = decide(
            &Caller::free(UserId::generate()),
            &GenerationRequest::new("a watercolor harbor").with_image_count(4),
            0,
        );
        assert!(!decision.allowed);
        assert!(decision.upgrade_required);
        assert_eq!(decision.reason, Some(DenialReason::MultiImageRequiresUpgrade));
    }

    #[test]
    fn flagged_prompt_wins_over_multi_image() {
        let decision = decide(
            &Caller::free(UserId::generate()),
            &GenerationRequest::new("NSFW portrait").with_image_count(4),
            0,
        );
        assert_eq!(decision.reason, Some(DenialReason::NsfwRequiresUpgrade));
    }

    #[test]
    fn weekly_limit_applies_to_free_only() {
        let request = GenerationRequest::new("a red kite");
        let limit = DEFAULT_FREE_WEEKLY_IMAGE_LIMIT;
        assert!(decide(&Caller::free(UserId::generate()), &request, limit - 1).allowed);
        assert_eq!(
            decide(&Caller::free(UserId::generate()), &request, limit).reason,
            Some(DenialReason::WeeklyFreeLimitReached)
        );
        assert!(decide(&Caller::premium(UserId::generate()), &request, limit * 5).allowed);
    }

    #[test]
    fn premium_pays_for_batches() {
        let decision = decide(
            &Caller::premium(UserId::generate()),
            &GenerationRequest::new("nude figure study").with_image_count(4),
            0,
        );
        assert!(decision.allowed);
        assert_eq!(decision.token_cost, 20);
    }

    #[test]
    fn admin_bypasses_everything_for_free() {
        let decision = decide(
            &Caller::admin(UserId::generate()),
            &GenerationRequest::new("explicit scene").with_image_count(8),
            1_000,
        );
        assert!(decision.allowed);
        assert_eq!(decision.token_cost, 0);
    }

    #[test]
    fn classifier_matches_whole_words() {
        let classifier = ContentClassifier::new(["sex", "no clothes"]);
        assert!(classifier.is_flagged("SEX on the beach"));
        assert!(classifier.is_flagged("a model with no clothes on"));
        assert!(!classifier.is_flagged("sussex countryside"));
        assert!(!classifier.is_flagged("no clothesline"));
    }
}
