use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::gadgets::{
    Gadget, GadgetFuture, GadgetInvocation, param_str, storage_failure, truncate_preview,
    write_json,
};
use crate::models::{ExecutionOutcome, FormSchema, GadgetDescriptor, ModeDescriptor};

const PREVIEW_CHARS: usize = 100;

const DESCRIPTOR: GadgetDescriptor = GadgetDescriptor {
    id: "encoder",
    name: "Encoder & Decoder",
    description: "Encodes and decodes text in various formats",
};

const MODES: &[ModeDescriptor] = &[
    ModeDescriptor {
        id: "base64_encode",
        name: "Base64 Encode",
        description: "Encode text to Base64",
    },
    ModeDescriptor {
        id: "base64_decode",
        name: "Base64 Decode",
        description: "Decode Base64 to text",
    },
    ModeDescriptor {
        id: "hex_encode",
        name: "Hex Encode",
        description: "Encode text to hexadecimal",
    },
    ModeDescriptor {
        id: "hex_decode",
        name: "Hex Decode",
        description: "Decode hexadecimal to text",
    },
    ModeDescriptor {
        id: "url_encode",
        name: "URL Encode",
        description: "Encode text for URLs",
    },
    ModeDescriptor {
        id: "url_decode",
        name: "URL Decode",
        description: "Decode URL-encoded text",
    },
    ModeDescriptor {
        id: "hash_sha256",
        name: "Hash (SHA-256)",
        description: "Generate SHA-256 hash of text",
    },
];

/// In-process text transforms. Never touches an external binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncoderGadget;

impl EncoderGadget {
    pub fn new() -> Self {
        Self
    }
}

impl Gadget for EncoderGadget {
    fn descriptor(&self) -> &GadgetDescriptor {
        &DESCRIPTOR
    }

    fn modes(&self) -> Vec<ModeDescriptor> {
        MODES.to_vec()
    }

    fn form_schema(&self, mode: &str) -> FormSchema {
        let (label, placeholder, description) = if mode.contains("decode") {
            (
                "Encoded Text",
                "Enter encoded text to decode",
                "The text you want to decode",
            )
        } else if mode.contains("hash") {
            (
                "Text to Hash",
                "Enter text to hash",
                "The text you want to generate a hash for",
            )
        } else {
            (
                "Text to Encode",
                "Enter text to encode",
                "The text you want to encode",
            )
        };

        json!({
            "input": {
                "type": "textarea",
                "label": label,
                "required": true,
                "placeholder": placeholder,
                "description": description,
            }
        })
    }

    fn execute(self: Box<Self>, invocation: GadgetInvocation) -> GadgetFuture {
        Box::pin(async move {
            let GadgetInvocation {
                task_id,
                mode,
                params,
                result_dir,
                ..
            } = invocation;
            let input = param_str(&params, "input").unwrap_or_default();

            let (output, error) = match transform(&mode, input) {
                Ok(output) => (output, None),
                Err(message) => (format!("ERROR: {message}"), Some(message)),
            };

            let result_file = result_dir.join("result.txt");
            tokio::fs::write(&result_file, output.as_bytes())
                .await
                .map_err(|io_error| storage_failure(DESCRIPTOR.id, &task_id, &result_file, io_error))?;

            write_json(
                DESCRIPTOR.id,
                &task_id,
                &result_dir.join("encoding.json"),
                &json!({
                    "mode": mode,
                    "input_length": input.chars().count(),
                    "output_length": output.chars().count(),
                    "error": error,
                }),
            )
            .await?;

            let outcome = match error {
                None => ExecutionOutcome::completed().result(json!(output)),
                Some(message) => ExecutionOutcome::failed(message),
            };

            Ok(outcome
                .result_file(result_file)
                .preview(truncate_preview(&output, PREVIEW_CHARS)))
        })
    }
}

fn transform(mode: &str, input: &str) -> Result<String, String> {
    let failed = |error: &dyn std::fmt::Display| format!("error processing {mode}: {error}");

    match mode {
        "base64_encode" => Ok(STANDARD.encode(input.as_bytes())),
        "base64_decode" => {
            let bytes = STANDARD
                .decode(input.trim().as_bytes())
                .map_err(|error| failed(&error))?;
            String::from_utf8(bytes).map_err(|error| failed(&error))
        }
        "hex_encode" => Ok(hex::encode(input.as_bytes())),
        "hex_decode" => {
            let bytes = hex::decode(input.trim()).map_err(|error| failed(&error))?;
            String::from_utf8(bytes).map_err(|error| failed(&error))
        }
        "url_encode" => Ok(urlencoding::encode(input).into_owned()),
        "url_decode" => urlencoding::decode(input)
            .map(|decoded| decoded.into_owned())
            .map_err(|error| failed(&error)),
        "hash_sha256" => Ok(hex::encode(Sha256::digest(input.as_bytes()))),
        other => Err(format!("unknown mode: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::transform;

    #[test]
    fn encodes_and_decodes_each_format() {
        assert_eq!(transform("base64_encode", "hi").unwrap(), "aGk=");
        assert_eq!(transform("base64_decode", "aGk=").unwrap(), "hi");
        assert_eq!(transform("hex_encode", "hi").unwrap(), "6869");
        assert_eq!(transform("hex_decode", "6869").unwrap(), "hi");
        assert_eq!(transform("url_encode", "a b&c").unwrap(), "a%20b%26c");
        assert_eq!(transform("url_decode", "a%20b%26c").unwrap(), "a b&c");
        assert_eq!(
            transform("hash_sha256", "abc").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn malformed_input_is_reported_not_panicked() {
        let error = transform("hex_decode", "zz").unwrap_err();
        assert!(error.starts_with("error processing hex_decode"));
        assert!(transform("rot13", "hi").unwrap_err().contains("unknown mode"));
    }
}
