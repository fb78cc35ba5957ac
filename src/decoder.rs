use crate::models::GenerateContentResponse;

/// Flattens every part of every candidate into one string, in order and
/// without separators. A missing response decodes to the empty string.
pub fn decode_response(response: Option<&GenerateContentResponse>) -> String {
    let Some(response) = response else {
        return String::new();
    };

    response
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .map(ToString::to_string)
        .collect()
}
