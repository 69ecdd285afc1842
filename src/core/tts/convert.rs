//! One-shot HTTP synthesis.
//!
//! The whole request is sent as one MessagePack body to `POST /v1/tts` and
//! the audio comes back as the response body, either buffered or streamed.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, error};

use super::messages::TtsRequest;
use crate::errors::{ClientError, ClientResult};

/// Path of the one-shot endpoint, relative to the base URL.
pub const CONVERT_PATH: &str = "/v1/tts";

/// Header selecting the synthesis backend.
pub const MODEL_HEADER: &str = "model";

const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Builds the conversion request without sending it.
pub fn build_convert_request(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    backend: &str,
    request: &TtsRequest,
) -> ClientResult<reqwest::RequestBuilder> {
    let body = request
        .to_msgpack()
        .map_err(|e| ClientError::Encode(e.to_string()))?;

    let url = format!("{}{}", base_url.trim_end_matches('/'), CONVERT_PATH);
    debug!(
        url = %url,
        backend = %backend,
        format = ?request.format,
        body_len = body.len(),
        "Building convert request"
    );

    Ok(client
        .post(url)
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
        .header(MODEL_HEADER, backend)
        .header(reqwest::header::CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
        .body(body))
}

/// Sends the request and rejects anything other than 2xx/3xx.
async fn send(builder: reqwest::RequestBuilder) -> ClientResult<reqwest::Response> {
    let response = builder
        .send()
        .await
        .map_err(|e| ClientError::Request(e.to_string()))?;

    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    error!(status = status.as_u16(), body = %body, "Convert request rejected");
    Err(ClientError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Performs the conversion and buffers the whole audio body.
pub async fn convert(builder: reqwest::RequestBuilder) -> ClientResult<Bytes> {
    let response = send(builder).await?;
    let audio = response
        .bytes()
        .await
        .map_err(|e| ClientError::Request(e.to_string()))?;
    debug!(bytes = audio.len(), "Convert completed");
    Ok(audio)
}

/// Performs the conversion and yields the audio body as it arrives.
pub async fn convert_stream(
    builder: reqwest::RequestBuilder,
) -> ClientResult<BoxStream<'static, ClientResult<Bytes>>> {
    let response = send(builder).await?;
    Ok(response
        .bytes_stream()
        .map_err(|e| ClientError::Request(e.to_string()))
        .boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tts::AudioFormat;

    fn build(base_url: &str) -> reqwest::Request {
        let client = reqwest::Client::new();
        let request = TtsRequest::new("Hello world").with_format(AudioFormat::Wav);
        build_convert_request(&client, base_url, "test-api-key", "s1", &request)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_convert_request_url() {
        let request = build("https://api.fish.audio");
        assert_eq!(request.url().as_str(), "https://api.fish.audio/v1/tts");
        assert_eq!(request.method(), reqwest::Method::POST);

        let request = build("http://localhost:8080/");
        assert_eq!(request.url().as_str(), "http://localhost:8080/v1/tts");
    }

    #[test]
    fn test_build_convert_request_headers() {
        let request = build("https://api.fish.audio");

        let auth = request.headers().get("authorization").unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer test-api-key");

        let model = request.headers().get("model").unwrap();
        assert_eq!(model.to_str().unwrap(), "s1");

        let content_type = request.headers().get("content-type").unwrap();
        assert_eq!(content_type.to_str().unwrap(), "application/msgpack");
    }

    #[test]
    fn test_build_convert_request_body_is_msgpack() {
        let request = build("https://api.fish.audio");
        let body = request.body().unwrap().as_bytes().unwrap();

        let decoded: serde_json::Value = rmp_serde::from_slice(body).unwrap();
        assert_eq!(decoded["text"], "Hello world");
        assert_eq!(decoded["format"], "wav");
    }
}
