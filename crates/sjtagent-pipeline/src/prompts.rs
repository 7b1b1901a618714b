//! Prompt text for the generation and evaluation steps.
//!
//! Templates use `{name}` placeholders filled by [`render`].

pub const TRAIT_ANALYSIS_SYSTEM: &str = "\
You are a trait analysis expert. Your task:
1) Decompose the target personality trait into cognitive, affective and behavioural components.
2) Map those components onto situation elements: observable cues, action bases and outcome feedback.
3) Answer with a JSON object with the fields trait, components, mapping, evidence_glossary.
   - components: {\"cognition\": [...], \"affect\": [...], \"behavior\": [...]} (3-6 entries each)
   - mapping: {\"observable_cues\": [...], \"action_bases\": [...], \"outcome_feedback\": [...]} (3-6 entries each)
   - evidence_glossary: {\"high\": [...], \"low\": [...]} typical words or phrases (8-15 each)
Stay close to the psychological definition of the trait and keep each entry short.";

pub const TRAIT_ANALYSIS_USER: &str = "\
Target trait: {trait_name}
Reference self-report item: {bfi_item}
Target population: {population_profile}
Output language: {language}
Complete steps 1-3 and answer strictly as JSON.";

pub const SITUATION_SYSTEM: &str = "\
You are a situation construction expert. Your task:
A) From the trait mapping and glossary, build a situation outline as JSON:
   - prototype: the situation archetype (teamwork, time pressure, moral dilemma, service conflict, ...)
   - setting: background (field, place, role, significant others)
   - task: the goal or deliverable
   - trigger: the triggering event or conflict
   - cues: at least 3 observable cues, taken from the mapping, that must appear in the narrative
   - constraints: resource, time or policy constraints
   - success_criteria: what counts as success
B) Write the situation narrative used as the item stem (scenario_text, 150-250 words).
Stay close to the target population's experience and avoid jargon.";

pub const SITUATION_USER: &str = "\
Target population: {population_profile}
Target trait: {trait_name}
Trait mapping: {trait_mapping}
Reference self-report item: {bfi_item}
Output language: {language}
Answer as JSON: {\"outline\": {...}, \"scenario_text\": \"...\"}";

pub const BEHAVIOR_SYSTEM: &str = "\
You are a behaviour adaptation expert. For the given situation, design 5 distinguishable response options A-E:
 - each option: {\"label\": \"A\", \"action\": \"...\", \"rationale\": \"...\", \"trait_level\": \"high|mid|low\"}
 - together they span the trait continuum (at least one high, one mid and one low option) without semantic overlap
 - every option fits the outline cues and constraints; no superpowers, no actions that need missing information
 - avoid social desirability leaks: no option may read as the obvious right answer
Answer as JSON: {\"options\": [...]}";

pub const BEHAVIOR_USER: &str = "\
Item stem: {scenario_text}
Situation outline: {outline}
Trait glossary (helps grade behaviour intensity): {glossary}
Output language: {language}
Return the 5 options as JSON.";

pub const REVISE_SYSTEM: &str = "\
You are an item revision assistant. Using the quality feedback, rewrite the situation narrative (if needed) and the options:
- keep the outline archetype and constraints unchanged
- improve option distinctiveness, trait-level coverage and consistency with the situation cues first
- answer as JSON: {\"scenario_text\": \"... (optional)\", \"options\": [...]}";

pub const REVISE_USER: &str = "\
Quality issues: {issues}
Item stem: {scenario_text}
Situation outline: {outline}
Current options: {options}
Output language: {language}
Revise and answer as JSON.";

pub const JUDGE_SYSTEM: &str = "\
You are a psychological assessment expert who judges the quality of situational judgement test items.
Answer with a single JSON object mapping every dimension name to \"A\" or \"B\". No other values are allowed.";

/// Replace every `{key}` in `template`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}
