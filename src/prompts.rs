//! Prompt templates for vision-model OCR policies.
//!
//! Every [`crate::policy::OcrPolicy`] carries its own template so a policy
//! change is a data change. The constants here are the built-in defaults;
//! `{tile_id}` and `{overlap_px}` placeholders are filled per request by
//! [`render_prompt`].

/// Default prompt for olmOCR-style models reading a web page screenshot tile.
pub const OLMOCR_PROMPT: &str = r#"You are transcribing one tile of a web page screenshot into Markdown.

Follow these rules precisely:

1. TEXT PRESERVATION
   - Transcribe ALL visible text exactly, in reading order
   - Do not correct spelling, do not summarise, do not translate
   - Text cut off at the top or bottom edge: transcribe the visible part only

2. STRUCTURE
   - Use # … #### for visually distinct headings, matching their relative size
   - Use - for bullet lists and 1. 2. 3. for numbered lists
   - Render link text as plain text unless the URL itself is visible

3. TABLES
   - Convert tables to GFM pipe format with a header separator row

4. WHAT TO IGNORE
   - Grey placeholder boxes (masked widgets), scrollbars, cursor artefacts
   - Navigation chrome that carries no content (icons without labels)

5. OUTPUT FORMAT
   - Output ONLY the Markdown content
   - Do NOT wrap in ```markdown fences
   - Do NOT add commentary or explanations"#;

/// Prompt for GLM-style models, which need the tile context spelled out.
pub const GLM_OCR_PROMPT: &str = r#"Read the screenshot tile {tile_id} and output its text as Markdown.
The top {overlap_px} pixels repeat the bottom of the previous tile; transcribe them anyway.
Keep headings, lists and tables. Output Markdown only, no fences, no commentary."#;

/// Fill a template's placeholders for one tile.
pub fn render_prompt(template: &str, tile_id: &str, overlap_px: u32) -> String {
    template
        .replace("{tile_id}", tile_id)
        .replace("{overlap_px}", &overlap_px.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_placeholders() {
        let p = render_prompt(GLM_OCR_PROMPT, "tile_0003", 240);
        assert!(p.contains("tile_0003"));
        assert!(p.contains("240 pixels"));
        assert!(!p.contains('{'));
    }

    #[test]
    fn olmocr_prompt_has_no_placeholders() {
        assert_eq!(render_prompt(OLMOCR_PROMPT, "x", 1), OLMOCR_PROMPT);
    }
}
