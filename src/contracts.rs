//! Contract bindings for the token, wrapper, bridge and vault interfaces
//!
//! Only calldata encoding/decoding is used from these bindings; every call is
//! routed through [`crate::chain::ChainReader`] or [`crate::tx::AccountSender`].

use ethers::abi::{AbiDecode, AbiEncode};
use ethers::types::{Bytes, U256};

use crate::error::{EngineError, EngineResult};

pub mod erc20 {
    ethers::contract::abigen!(
        IERC20,
        r#"[
            function balanceOf(address owner) external view returns (uint256)
            function decimals() external view returns (uint8)
            function allowance(address owner, address spender) external view returns (uint256)
            function approve(address spender, uint256 amount) external returns (bool)
            function transfer(address to, uint256 amount) external returns (bool)
        ]"#
    );
}

pub mod weth {
    ethers::contract::abigen!(
        IWETH,
        r#"[
            function deposit() external payable
            function withdraw(uint256 amount) external
        ]"#
    );
}

pub mod spoke_pool {
    ethers::contract::abigen!(
        SpokePool,
        r#"[
            function depositV3(address depositor, address recipient, address inputToken, address outputToken, uint256 inputAmount, uint256 outputAmount, uint256 destinationChainId, address exclusiveRelayer, uint32 quoteTimestamp, uint32 fillDeadline, uint32 exclusivityDeadline, bytes message) external payable
        ]"#
    );
}

pub mod vault {
    ethers::contract::abigen!(
        IVault,
        r#"[
            function deposit(uint256 assets, address receiver) external returns (uint256)
            function withdraw(uint256 assets, address receiver, address owner) external returns (uint256)
            function redeem(uint256 shares, address receiver, address owner) external returns (uint256)
            function balanceOf(address owner) external view returns (uint256)
            function convertToAssets(uint256 shares) external view returns (uint256)
            function convertToShares(uint256 assets) external view returns (uint256)
        ]"#
    );
}

/// ABI-encode a call (selector included)
pub fn calldata<C: AbiEncode>(call: C) -> Bytes {
    call.encode().into()
}

/// Decode a single `uint256` return value
pub fn decode_uint(output: &[u8]) -> EngineResult<U256> {
    U256::decode(output).map_err(|e| EngineError::Contract(format!("bad uint256 return: {}", e)))
}
