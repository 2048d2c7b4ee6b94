//! Line oriented JSON protocol exposing the bridges to another process.
//!
//! Each request is one line `{"id", "method", "params"}`, each response one
//! line `{"id", "result"}` or `{"id", "error"}`.

use std::io::{BufRead, Write};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Level, debug, span, warn};

use crate::bridge::{FacenetBridge, MtcnnBridge};
use crate::config::VERSION;
use crate::marshal::{self, PixelArray};

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Response {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, error: &anyhow::Error) -> Response {
        Response {
            id,
            result: None,
            error: Some(format!("{error:#}")),
        }
    }
}

/// `data` is base64 text or a JSON pixel array.
#[derive(Debug, Deserialize)]
struct ImageParams {
    data: Value,
    row: usize,
    col: usize,
    depth: usize,
}

impl ImageParams {
    fn decode(&self) -> Result<PixelArray> {
        match &self.data {
            Value::String(text) => marshal::base64_to_image(text, self.row, self.col, self.depth),
            array @ Value::Array(_) => {
                marshal::json_value_to_image(array, self.row, self.col, self.depth)
            }
            other => bail!("data must be a base64 string or an array, got {other}"),
        }
    }
}

pub struct Server {
    facenet: FacenetBridge,
    mtcnn: MtcnnBridge,
    running: bool,
}

impl Server {
    pub fn new(facenet: FacenetBridge, mtcnn: MtcnnBridge) -> Server {
        Server {
            facenet,
            mtcnn,
            running: true,
        }
    }

    /// Serves until `quit` or end of input.
    pub fn run<R: BufRead, W: Write>(&mut self, reader: R, mut writer: W) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line);
            serde_json::to_writer(&mut writer, &response)?;
            writer.write_all(b"\n")?;
            writer.flush()?;

            if !self.running {
                break;
            }
        }
        Ok(())
    }

    pub fn handle_line(&mut self, line: &str) -> Response {
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("bad request: {e}");
                return Response::err(Value::Null, &anyhow::Error::from(e));
            }
        };
        let id = request.id.clone();
        match self.dispatch(request) {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                warn!("{e:#}");
                Response::err(id, &e)
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Value> {
        let span = span!(Level::DEBUG, "serve", method = request.method.as_str());
        let _guard = span.enter();
        debug!("id {}", request.id);

        match request.method.as_str() {
            "version" => Ok(json!(VERSION)),
            "init_facenet" => {
                self.facenet.init()?;
                Ok(Value::Null)
            }
            "init_mtcnn" => {
                self.mtcnn.init()?;
                Ok(Value::Null)
            }
            "embedding" => {
                let params: ImageParams = serde_json::from_value(request.params)?;
                let embedding = self.facenet.embedding_image(&params.decode()?)?;
                Ok(json!(embedding))
            }
            "align" => {
                let params: ImageParams = serde_json::from_value(request.params)?;
                let detection = self.mtcnn.align_image(&params.decode()?)?;
                Ok(json!([detection.boxes, detection.landmark_rows()]))
            }
            "quit" => {
                self.facenet.close();
                self.mtcnn.close();
                self.running = false;
                Ok(Value::Null)
            }
            other => bail!("unknown method {other:?}"),
        }
    }
}
