use async_openai::types::{
    ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::error::AppError;

const MENU_TRANSCRIPTION_PROMPT: &str = r#"This image shows a menu, price list or product sheet.
Transcribe every item verbatim, one per line, keeping prices, sizes, option groups and add-ons next to the item they belong to.
Keep section headings on their own lines. Do not add commentary."#;

/// Sends a menu photo to the vision model and returns its transcription.
pub async fn transcribe_image(
    image_bytes: &[u8],
    media_type: &str,
    model: &str,
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
) -> Result<String, AppError> {
    let image_url = image_data_url(image_bytes, media_type);

    let request = CreateChatCompletionRequestArgs::default()
        .model(model)
        .max_tokens(6400_u32)
        .messages([ChatCompletionRequestUserMessageArgs::default()
            .content(vec![
                ChatCompletionRequestMessageContentPartTextArgs::default()
                    .text(MENU_TRANSCRIPTION_PROMPT)
                    .build()?
                    .into(),
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(
                        ImageUrlArgs::default()
                            .url(image_url)
                            .detail(ImageDetail::High)
                            .build()?,
                    )
                    .build()?
                    .into(),
            ])
            .build()?
            .into()])
        .build()?;

    let response = client
        .chat()
        .create(request)
        .await
        .map_err(|err| AppError::Extraction(format!("image transcription request failed: {err}")))?;

    let transcription = response
        .choices
        .first()
        .and_then(|c| c.message.content.as_ref())
        .map(|text| text.trim().to_string())
        .unwrap_or_default();

    if transcription.is_empty() {
        return Err(AppError::UnparseableDocument(
            "vision model returned no text for the image".into(),
        ));
    }

    Ok(transcription)
}

fn image_data_url(image_bytes: &[u8], media_type: &str) -> String {
    format!("data:{media_type};base64,{}", STANDARD.encode(image_bytes))
}
