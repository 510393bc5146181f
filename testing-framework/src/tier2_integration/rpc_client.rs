//! JSON-RPC binding of `NodeRpc` for a running regtest node.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use regtest_common::{
    crypto::Hash,
    serializer::Serializer,
    transaction::{OutPoint, Transaction},
    utils::{format_coin, parse_coin},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, value::RawValue, Value};

use super::{MempoolEntry, NodeRpc, RpcError, ScanResult, ScanUnspent};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

// Results stay as raw text until typed, so coin amounts never pass
// through f64
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Box<RawValue>>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawMempoolEntry {
    vsize: u64,
    weight: u64,
    time: u64,
    height: u64,
    fees: RawFees,
    #[serde(default)]
    depends: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFees {
    base: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawScanResult {
    height: u64,
    bestblock: String,
    unspents: Vec<RawUnspent>,
    total_amount: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawUnspent {
    txid: String,
    vout: u32,
    #[serde(rename = "scriptPubKey")]
    script_pubkey: String,
    desc: String,
    amount: Box<RawValue>,
    #[serde(default)]
    coinbase: bool,
    height: u64,
}

/// Node reached over its JSON-RPC interface.
///
/// Requests are JSON-RPC 1.0 over HTTP POST with basic auth; wallet calls go
/// to `/wallet/<name>`. Error objects are passed through verbatim as
/// [`RpcError::Rpc`], whatever the HTTP status.
pub struct RpcNode {
    url: String,
    user: String,
    password: String,
    client: reqwest::Client,
    request_id: AtomicU64,
    p2p_endpoint: SocketAddr,
}

impl RpcNode {
    /// # Arguments
    ///
    /// * `url` - Base URL of the RPC server, e.g. `http://127.0.0.1:18443`
    /// * `p2p_endpoint` - Where the node accepts peer connections
    pub fn new(url: impl Into<String>, p2p_endpoint: SocketAddr) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.into().trim_end_matches('/').to_string(),
            user: String::new(),
            password: String::new(),
            client,
            request_id: AtomicU64::new(1),
            p2p_endpoint,
        })
    }

    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Call `method` on the node endpoint.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        self.call_at(&self.url, method, params).await
    }

    async fn call_wallet<T: DeserializeOwned>(
        &self,
        wallet: &str,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let url = format!("{}/wallet/{}", self.url, wallet);
        self.call_at(&url, method, params).await
    }

    async fn call_at<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: self.next_id(),
            method,
            params,
        };
        trace!("rpc -> {} {}", method, request.params);

        let response = self
            .client
            .post(url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("{}: {}", method, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(format!("{}: {}", method, e)))?;
        let parsed: JsonRpcResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Err(RpcError::Transport(format!(
                    "{}: HTTP {} with unparsable body",
                    method, status
                )))
            }
        };

        if let Some(error) = parsed.error {
            debug!("rpc {} failed: {} ({})", method, error.message, error.code);
            return Err(RpcError::rpc(error.code, error.message));
        }
        let result = parsed.result.as_deref().map_or("null", RawValue::get);
        serde_json::from_str(result).map_err(|e| RpcError::invalid_response(method, e))
    }
}

/// Satoshis from a JSON number, read from its decimal text.
fn amount_from_json(method: &str, value: &RawValue) -> Result<u64, RpcError> {
    let text = value.get();
    if !text.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return Err(RpcError::invalid_response(method, "amount is not a number"));
    }
    parse_coin(text).map_err(|e| RpcError::invalid_response(method, e))
}

fn parse_hash(method: &str, value: &str) -> Result<Hash, RpcError> {
    Hash::from_str(value).map_err(|e| RpcError::invalid_response(method, e))
}

fn parse_hashes(method: &str, values: Vec<String>) -> Result<Vec<Hash>, RpcError> {
    values.iter().map(|value| parse_hash(method, value)).collect()
}

#[async_trait]
impl NodeRpc for RpcNode {
    async fn create_wallet(&self, name: &str) -> Result<(), RpcError> {
        let _: Value = self.call("createwallet", json!([name])).await?;
        Ok(())
    }

    async fn get_new_address(&self, wallet: &str) -> Result<String, RpcError> {
        self.call_wallet(wallet, "getnewaddress", json!([])).await
    }

    async fn get_balance(&self, wallet: &str) -> Result<u64, RpcError> {
        let value: Box<RawValue> = self.call_wallet(wallet, "getbalance", json!([])).await?;
        amount_from_json("getbalance", &value)
    }

    async fn send_to_address(
        &self,
        wallet: &str,
        address: &str,
        amount: u64,
    ) -> Result<Hash, RpcError> {
        let txid: String = self
            .call_wallet(
                wallet,
                "sendtoaddress",
                json!([address, format_coin(amount)]),
            )
            .await?;
        parse_hash("sendtoaddress", &txid)
    }

    async fn get_raw_mempool(&self) -> Result<Vec<Hash>, RpcError> {
        let txids: Vec<String> = self.call("getrawmempool", json!([])).await?;
        parse_hashes("getrawmempool", txids)
    }

    async fn get_mempool_entry(&self, txid: &Hash) -> Result<MempoolEntry, RpcError> {
        let method = "getmempoolentry";
        let raw: RawMempoolEntry = self.call(method, json!([txid.to_hex()])).await?;
        Ok(MempoolEntry {
            vsize: raw.vsize,
            weight: raw.weight,
            fee: amount_from_json(method, &raw.fees.base)?,
            time: raw.time,
            height: raw.height,
            depends: parse_hashes(method, raw.depends)?,
        })
    }

    async fn get_best_block_hash(&self) -> Result<Hash, RpcError> {
        let hash: String = self.call("getbestblockhash", json!([])).await?;
        parse_hash("getbestblockhash", &hash)
    }

    async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    async fn generate_to_address(&self, count: u64, address: &str) -> Result<Vec<Hash>, RpcError> {
        let hashes: Vec<String> = self
            .call("generatetoaddress", json!([count, address]))
            .await?;
        parse_hashes("generatetoaddress", hashes)
    }

    async fn generate_to_descriptor(
        &self,
        count: u64,
        descriptor: &str,
    ) -> Result<Vec<Hash>, RpcError> {
        let hashes: Vec<String> = self
            .call("generatetodescriptor", json!([count, descriptor]))
            .await?;
        parse_hashes("generatetodescriptor", hashes)
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Hash, RpcError> {
        let txid: String = self.call("sendrawtransaction", json!([tx.to_hex()])).await?;
        parse_hash("sendrawtransaction", &txid)
    }

    async fn scan_tx_out_set(&self, descriptors: &[String]) -> Result<ScanResult, RpcError> {
        let method = "scantxoutset";
        let raw: RawScanResult = self.call(method, json!(["start", descriptors])).await?;

        let mut unspents = Vec::with_capacity(raw.unspents.len());
        for unspent in raw.unspents {
            unspents.push(ScanUnspent {
                outpoint: OutPoint::new(parse_hash(method, &unspent.txid)?, unspent.vout),
                script_pubkey: hex::decode(&unspent.script_pubkey)
                    .map_err(|e| RpcError::invalid_response(method, e))?,
                desc: unspent.desc,
                amount: amount_from_json(method, &unspent.amount)?,
                coinbase: unspent.coinbase,
                height: unspent.height,
            });
        }

        Ok(ScanResult {
            height: raw.height,
            best_block: parse_hash(method, &raw.bestblock)?,
            unspents,
            total_amount: amount_from_json(method, &raw.total_amount)?,
        })
    }

    async fn add_node(&self, endpoint: SocketAddr) -> Result<(), RpcError> {
        let _: Value = self
            .call("addnode", json!([endpoint.to_string(), "onetry"]))
            .await?;
        Ok(())
    }

    async fn disconnect_node(&self, endpoint: SocketAddr) -> Result<(), RpcError> {
        let _: Value = self
            .call("disconnectnode", json!([endpoint.to_string()]))
            .await?;
        Ok(())
    }

    async fn get_connection_count(&self) -> Result<usize, RpcError> {
        self.call("getconnectioncount", json!([])).await
    }

    fn p2p_endpoint(&self) -> SocketAddr {
        self.p2p_endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtest_common::config::COIN;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn amount(text: &str) -> Result<u64, RpcError> {
        let raw = RawValue::from_string(text.to_string()).unwrap();
        amount_from_json("t", &raw)
    }

    #[test]
    fn test_amount_conversion_is_exact() {
        assert_eq!(amount("50.0").unwrap(), 50 * COIN);
        assert_eq!(amount("0.00000001").unwrap(), 1);
        assert_eq!(amount("1e-8").unwrap(), 1);
        assert_eq!(amount("20999999.9769").unwrap(), 2_099_999_997_690_000);
        // Beyond f64's 53 bit mantissa
        assert_eq!(amount("90071992.54740993").unwrap(), 9_007_199_254_740_993);
        // Sub-satoshi precision is an error, never rounded away
        assert!(amount("0.000000001").is_err());
        assert!(amount("-1.0").is_err());
        assert!(amount("\"1.0\"").is_err());
        assert!(amount("null").is_err());
    }

    #[test]
    fn test_amounts_inside_results_are_exact() {
        let body = r#"{"height":101,"bestblock":"00","unspents":[{"txid":"aa","vout":0,"scriptPubKey":"51","desc":"raw(51)","amount":90071992.54740993,"coinbase":true,"height":1}],"total_amount":90071992.54740993}"#;
        let raw: RawScanResult = serde_json::from_str(body).unwrap();
        assert_eq!(amount_from_json("t", &raw.total_amount).unwrap(), 9_007_199_254_740_993);
        assert_eq!(amount_from_json("t", &raw.unspents[0].amount).unwrap(), 9_007_199_254_740_993);
    }

    // Serve one canned HTTP response and return the request it received
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 8192];
            let mut request = Vec::new();
            // Headers and a small JSON body arrive together on loopback
            loop {
                let n = socket.read(&mut buffer).await.unwrap();
                request.extend_from_slice(&buffer[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length: ").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_error_object_passes_through() {
        let (url, server) = serve_once(
            "500 Internal Server Error",
            r#"{"result":null,"error":{"code":-26,"message":"min relay fee not met, 0 < 110"},"id":1}"#,
        )
        .await;
        let node = RpcNode::new(url, "127.0.0.1:18444".parse().unwrap())
            .unwrap()
            .with_auth("user", "pass");

        let tx = Transaction::new(Vec::new(), Vec::new());
        let err = node.send_raw_transaction(&tx).await.unwrap_err();
        assert_eq!(err, RpcError::rpc(-26, "min relay fee not met, 0 < 110"));

        let request = server.await.unwrap();
        assert!(request.contains("\"method\":\"sendrawtransaction\""));
        assert!(request.to_ascii_lowercase().contains("authorization: basic"));
    }

    #[tokio::test]
    async fn test_wallet_calls_use_wallet_path() {
        let (url, server) = serve_once("200 OK", r#"{"result":1.5,"error":null,"id":1}"#).await;
        let node = RpcNode::new(url, "127.0.0.1:18444".parse().unwrap()).unwrap();

        assert_eq!(node.get_balance("w1").await.unwrap(), 150_000_000);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /wallet/w1 "));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let node = RpcNode::new(url, "127.0.0.1:18444".parse().unwrap()).unwrap();
        let err = node.get_block_count().await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
